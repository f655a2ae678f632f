//! Enrolled identities and their reference encodings.

use crate::db;
use chrono::Utc;
use rollcall_core::{Encoding, EncodingError, Identity, IdentityId};
use rusqlite::{params, Connection, ErrorCode};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

const MAX_NAME_LEN: usize = 200;
const MAX_ROLL_NUMBER_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error("roll number {0:?} is already enrolled")]
    DuplicateRollNumber(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("stored encoding for identity {0} is corrupt: {1}")]
    Corrupt(IdentityId, EncodingError),
}

/// Read-mostly identity store backed by the `identities` table.
///
/// Readers get an immutable `Arc` snapshot; writers build a new vector and
/// swap it in under the write lock. A matcher holding an old snapshot keeps
/// comparing against exactly what it started with.
pub struct EncodingStore {
    conn: Mutex<Connection>,
    snapshot: RwLock<Arc<Vec<Identity>>>,
    dimension: usize,
}

impl EncodingStore {
    /// Load all identities from `conn`. Every encoding must have `dimension` values.
    pub fn open(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        let identities = load_all(&conn)?;
        tracing::info!(count = identities.len(), dimension, "identities loaded");

        Ok(Self {
            conn: Mutex::new(conn),
            snapshot: RwLock::new(Arc::new(identities)),
            dimension,
        })
    }

    /// Enroll a new identity.
    pub fn enroll(&self, name: &str, encoding: Encoding) -> Result<Identity, StoreError> {
        self.enroll_with_roll_number(name, None, encoding)
    }

    /// Enroll a new identity under an optional roll number. A blank roll
    /// number counts as none.
    pub fn enroll_with_roll_number(
        &self,
        name: &str,
        roll_number: Option<&str>,
        encoding: Encoding,
    ) -> Result<Identity, StoreError> {
        let name = validate_name(name)?;
        let roll_number = validate_roll_number(roll_number)?;
        self.validate_encoding(&encoding)?;
        let enrolled_at = Utc::now();

        let mut snapshot = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        if let Some(roll) = &roll_number {
            if snapshot.iter().any(|i| i.roll_number.as_ref() == Some(roll)) {
                return Err(StoreError::DuplicateRollNumber(roll.clone()));
            }
        }
        let id = {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            let inserted = conn.execute(
                "INSERT INTO identities (name, roll_number, encoding, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    name,
                    roll_number,
                    encoding.to_le_bytes(),
                    db::format_timestamp(enrolled_at)
                ],
            );
            match inserted {
                Ok(_) => conn.last_insert_rowid(),
                // Another process enrolled the same roll number first.
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::DuplicateRollNumber(
                        roll_number.unwrap_or_default(),
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let identity = Identity {
            id,
            name,
            roll_number,
            encoding,
            enrolled_at,
        };
        let mut next = Vec::with_capacity(snapshot.len() + 1);
        next.extend(snapshot.iter().cloned());
        next.push(identity.clone());
        *snapshot = Arc::new(next);

        tracing::info!(
            identity = id,
            name = %identity.name,
            roll_number = identity.roll_number.as_deref().unwrap_or("-"),
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Replace the reference encoding of an existing identity.
    pub fn reenroll(&self, id: IdentityId, encoding: Encoding) -> Result<Identity, StoreError> {
        self.validate_encoding(&encoding)?;

        let mut snapshot = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        let pos = snapshot
            .iter()
            .position(|i| i.id == id)
            .ok_or(StoreError::NotFound(id))?;

        {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            let updated = conn.execute(
                "UPDATE identities SET encoding = ?1 WHERE id = ?2",
                params![encoding.to_le_bytes(), id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(id));
            }
        }

        let mut next: Vec<Identity> = snapshot.iter().cloned().collect();
        next[pos].encoding = encoding;
        let identity = next[pos].clone();
        *snapshot = Arc::new(next);

        tracing::info!(identity = id, "identity re-enrolled");
        Ok(identity)
    }

    /// Snapshot of every enrolled identity.
    pub fn all(&self) -> Arc<Vec<Identity>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn find_by_id(&self, id: IdentityId) -> Result<Identity, StoreError> {
        self.all()
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Re-read a single row from disk, bypassing the snapshot.
    #[cfg(test)]
    fn load_row(&self, id: IdentityId) -> Result<Option<Encoding>, StoreError> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT encoding FROM identities WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| Encoding::from_le_bytes(&b).map_err(|e| StoreError::Corrupt(id, e)))
            .transpose()
    }

    fn validate_encoding(&self, encoding: &Encoding) -> Result<(), StoreError> {
        encoding
            .validate(self.dimension)
            .map_err(|e| StoreError::InvalidInput(e.to_string()))
    }
}

fn validate_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::InvalidInput(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_roll_number(roll_number: Option<&str>) -> Result<Option<String>, StoreError> {
    let Some(roll) = roll_number.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if roll.chars().count() > MAX_ROLL_NUMBER_LEN {
        return Err(StoreError::InvalidInput(format!(
            "roll number longer than {MAX_ROLL_NUMBER_LEN} characters"
        )));
    }
    Ok(Some(roll.to_string()))
}

fn load_all(conn: &Connection) -> Result<Vec<Identity>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, roll_number, encoding, enrolled_at FROM identities ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, IdentityId>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut identities = Vec::new();
    for row in rows {
        let (id, name, roll_number, blob, enrolled_at) = row?;
        let encoding = Encoding::from_le_bytes(&blob).map_err(|e| StoreError::Corrupt(id, e))?;
        let enrolled_at = db::parse_timestamp(&enrolled_at).unwrap_or_else(|| {
            tracing::warn!(identity = id, value = %enrolled_at, "unparseable enrolled_at");
            chrono::DateTime::<Utc>::default()
        });
        identities.push(Identity {
            id,
            name,
            roll_number,
            encoding,
            enrolled_at,
        });
    }
    Ok(identities)
}
