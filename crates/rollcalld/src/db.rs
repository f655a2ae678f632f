//! SQLite connection setup and schema migrations.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;

const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open (creating if needed) the database at `path` and bring the schema up to date.
///
/// Each component opens its own connection; WAL lets the API read while the
/// recognition loop writes.
pub fn open(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        tracing::warn!(error = %err, "failed to enable WAL mode");
    }
    conn.busy_timeout(busy_timeout)
        .context("failed to set busy timeout")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// In-memory database with the current schema.
#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let mut conn = Connection::open_in_memory().expect("in-memory sqlite");
    run_migrations(&mut conn).expect("migrations");
    conn
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    tracing::info!(version = CURRENT_SCHEMA_VERSION, "database schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(include_str!("migrations/schema_v1.sql"))
                .context("failed to execute schema_v1.sql")?;
            Ok(())
        }
        2 => {
            tx.execute_batch(include_str!("migrations/schema_v2.sql"))
                .context("failed to execute schema_v2.sql")?;
            Ok(())
        }
        other => bail!("no migration defined for version {other}"),
    }
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so stored timestamps sort as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        let first = open(&path, Duration::from_secs(1)).unwrap();
        drop(first);
        let mut conn = open(&path, Duration::from_secs(1)).unwrap();
        run_migrations(&mut conn).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_v1_database_gains_roll_numbers() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("migrations/schema_v1.sql")).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO identities (name, encoding, enrolled_at) VALUES ('Old', x'', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();
        let roll: Option<String> = conn
            .query_row("SELECT roll_number FROM identities WHERE name = 'Old'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(roll, None);

        conn.execute(
            "INSERT INTO identities (name, roll_number, encoding, enrolled_at) VALUES ('A', 'R1', x'', 'x')",
            [],
        )
        .unwrap();
        assert!(conn
            .execute(
                "INSERT INTO identities (name, roll_number, encoding, enrolled_at) VALUES ('B', 'R1', x'', 'x')",
                [],
            )
            .is_err());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = open_in_memory();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();
        assert!(run_migrations(&mut conn).is_err());
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(a, "2026-10-19T08:00:00.000000Z");
        assert_eq!(parse_timestamp(&b), Some(late));
    }
}
