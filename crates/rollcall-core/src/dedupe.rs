//! Per-day gate that keeps repeated sightings from re-committing attendance.

use crate::types::IdentityId;
use chrono::NaiveDate;
use std::collections::HashSet;

/// Identities already committed for the current attendance day.
///
/// Owned by the recognition worker; no internal locking. The set belongs to
/// exactly one date: the first call carrying a different date clears it
/// entirely before answering.
#[derive(Debug, Default)]
pub struct SessionDeduper {
    date: Option<NaiveDate>,
    committed: HashSet<IdentityId>,
}

impl SessionDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the gate from identities already recorded on `date`.
    pub fn seeded(date: NaiveDate, committed: impl IntoIterator<Item = IdentityId>) -> Self {
        Self {
            date: Some(date),
            committed: committed.into_iter().collect(),
        }
    }

    /// Whether a sighting of `id` on `today` should go to the ledger.
    ///
    /// Does not close the gate; only [`mark_committed`](Self::mark_committed)
    /// does, so a failed commit is retried on the next sighting.
    pub fn should_commit(&mut self, id: IdentityId, today: NaiveDate) -> bool {
        self.roll_to(today);
        !self.committed.contains(&id)
    }

    /// Close the gate for `id` on `today`. Idempotent.
    pub fn mark_committed(&mut self, id: IdentityId, today: NaiveDate) {
        self.roll_to(today);
        self.committed.insert(id);
    }

    /// Date the gate currently belongs to.
    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    fn roll_to(&mut self, today: NaiveDate) {
        if self.date == Some(today) {
            return;
        }
        if let Some(previous) = self.date {
            tracing::info!(
                from = %previous,
                to = %today,
                cleared = self.committed.len(),
                "day rollover: session dedupe reset"
            );
        }
        self.committed.clear();
        self.date = Some(today);
    }
}
