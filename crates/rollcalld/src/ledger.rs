//! Durable, append-only attendance records.

use crate::db;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::IdentityId;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance store error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
    #[error("attendance commit timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt attendance row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

/// One person's attendance on one day. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub identity_id: IdentityId,
    pub date: NaiveDate,
    pub first_seen_at: DateTime<Utc>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyRecorded,
}

/// Attendance persistence. At most one record per `(identity, date)` is ever
/// stored, regardless of how many callers race on the same key.
pub trait AttendanceLedger: Send + Sync {
    fn record_if_absent(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        seen_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, LedgerError>;

    /// Records for `date`, earliest `first_seen_at` first.
    fn list_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Every record ever stored, most recent `first_seen_at` first.
    fn list_all(&self) -> Result<Vec<AttendanceRecord>, LedgerError>;

    fn count_for_date(&self, date: NaiveDate) -> Result<usize, LedgerError>;

    /// Per-day record counts for the most recent `days` dates that have any, newest first.
    fn daily_counts(&self, days: usize) -> Result<Vec<(NaiveDate, usize)>, LedgerError>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl AttendanceLedger for SqliteLedger {
    fn record_if_absent(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        seen_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO attendance (identity_id, date, first_seen_at, status)
             VALUES (?1, ?2, ?3, 'present')",
            params![
                identity,
                date.format(DATE_FORMAT).to_string(),
                db::format_timestamp(seen_at)
            ],
        )?;
        tx.commit()?;

        Ok(if inserted == 1 {
            CommitOutcome::Committed
        } else {
            CommitOutcome::AlreadyRecorded
        })
    }

    fn list_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT identity_id, first_seen_at FROM attendance
             WHERE date = ?1
             ORDER BY first_seen_at ASC, identity_id ASC",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok((
                row.get::<_, IdentityId>(0)?,
                date.format(DATE_FORMAT).to_string(),
                row.get::<_, String>(1)?,
            ))
        })?;
        let records: Result<Vec<_>, LedgerError> =
            rows.map(|row| decode_record(row?)).collect();
        records
    }

    fn list_all(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT identity_id, date, first_seen_at FROM attendance
             ORDER BY first_seen_at DESC, identity_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, IdentityId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let records: Result<Vec<_>, LedgerError> =
            rows.map(|row| decode_record(row?)).collect();
        records
    }

    fn count_for_date(&self, date: NaiveDate) -> Result<usize, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?1",
            params![date.format(DATE_FORMAT).to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn daily_counts(&self, days: usize) -> Result<Vec<(NaiveDate, usize)>, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT date, COUNT(*) FROM attendance
             GROUP BY date
             ORDER BY date DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(days).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (date, count) = row?;
            let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
                .map_err(|e| LedgerError::Corrupt(format!("date {date:?}: {e}")))?;
            out.push((date, count.max(0) as usize));
        }
        Ok(out)
    }
}

fn decode_record(
    (identity_id, date, seen): (IdentityId, String, String),
) -> Result<AttendanceRecord, LedgerError> {
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| LedgerError::Corrupt(format!("date {date:?}: {e}")))?;
    let first_seen_at = db::parse_timestamp(&seen)
        .ok_or_else(|| LedgerError::Corrupt(format!("first_seen_at {seen:?}")))?;
    Ok(AttendanceRecord {
        identity_id,
        date,
        first_seen_at,
        status: AttendanceStatus::Present,
    })
}
