//! Read-only status and statistics composed from the loop, ledger and store.

use crate::engine::{LoopController, LoopPhase};
use crate::ledger::AttendanceLedger;
use crate::signaler::HardwareSignaler;
use crate::store::EncodingStore;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::DayClock;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub recognition_running: bool,
    pub camera_connected: bool,
    /// `None` when the ledger could not be read.
    pub present_today: Option<usize>,
    #[serde(rename = "totalStudents")]
    pub total_enrolled: usize,
    pub state: LoopPhase,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub feedback_connected: bool,
    pub feedback_dropped: u64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_students: usize,
    pub present_today: usize,
    pub absent_today: usize,
    /// Percentage of enrolled identities present today, one decimal place.
    pub attendance_rate: f64,
    pub daily: Vec<DailyCount>,
}

#[derive(Clone)]
pub struct StatusAggregator {
    controller: LoopController,
    ledger: Arc<dyn AttendanceLedger>,
    store: Arc<EncodingStore>,
    signaler: HardwareSignaler,
    clock: DayClock,
}

impl StatusAggregator {
    pub fn new(
        controller: LoopController,
        ledger: Arc<dyn AttendanceLedger>,
        store: Arc<EncodingStore>,
        signaler: HardwareSignaler,
        clock: DayClock,
    ) -> Self {
        Self {
            controller,
            ledger,
            store,
            signaler,
            clock,
        }
    }

    /// Never fails; a ledger error shows up as `present_today: None`.
    pub fn current_status(&self) -> Status {
        let loop_state = self.controller.state();
        let feedback = self.signaler.stats();
        let today = self.clock.today();

        let present_today = match self.ledger.count_for_date(today) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "status: attendance count unavailable");
                None
            }
        };

        Status {
            recognition_running: loop_state.running,
            camera_connected: loop_state.camera_connected,
            present_today,
            total_enrolled: self.store.len(),
            state: loop_state.phase,
            last_frame_at: loop_state.last_frame_at,
            last_error: loop_state.last_error,
            feedback_connected: feedback.connected,
            feedback_dropped: feedback.dropped,
            date: today,
        }
    }

    pub fn stats(&self, days: usize) -> Result<Stats, crate::ledger::LedgerError> {
        let today = self.clock.today();
        let total = self.store.len();
        let present = self.ledger.count_for_date(today)?;
        let daily = self
            .ledger
            .daily_counts(days)?
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect();

        Ok(Stats {
            total_students: total,
            present_today: present,
            absent_today: total.saturating_sub(present),
            attendance_rate: attendance_rate(present, total),
            daily,
        })
    }
}

fn attendance_rate(present: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = present as f64 / total as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::engine::{spawn_loop, LoopDeps, LoopSettings};
    use crate::testing::{FakeEncoder, FakeOpener, FlakyLedger};
    use rollcall_core::{DistanceMatcher, DistanceMetric, Encoding};
    use rollcall_hw::{NullSink, SignalMap};

    fn aggregator() -> (StatusAggregator, Arc<FlakyLedger>, Arc<EncodingStore>) {
        let store = Arc::new(EncodingStore::open(db::open_in_memory(), 2).unwrap());
        let ledger = Arc::new(FlakyLedger::new());
        let clock: DayClock = "utc".parse().unwrap();
        let (signaler, _) =
            HardwareSignaler::spawn(Box::new(NullSink), SignalMap::default(), 4).unwrap();
        let (controller, _) = spawn_loop(
            LoopDeps {
                opener: Box::new(FakeOpener::new()),
                encoder: Box::new(FakeEncoder::new()),
                matcher: Box::new(DistanceMatcher::new(DistanceMetric::Euclidean, 0.5)),
                store: Arc::clone(&store),
                ledger: ledger.clone(),
                signaler: signaler.clone(),
                clock,
            },
            LoopSettings::default(),
        )
        .unwrap();
        let agg = StatusAggregator::new(controller, ledger.clone(), Arc::clone(&store), signaler, clock);
        (agg, ledger, store)
    }

    #[test]
    fn test_status_composes_sources() {
        let (agg, ledger, store) = aggregator();
        let a = store.enroll("A", Encoding::new(vec![0.0, 0.0])).unwrap();
        store.enroll("B", Encoding::new(vec![1.0, 1.0])).unwrap();
        ledger
            .record_if_absent(a.id, agg.clock.today(), Utc::now())
            .unwrap();

        let status = agg.current_status();
        assert!(!status.recognition_running);
        assert!(!status.camera_connected);
        assert_eq!(status.state, LoopPhase::Stopped);
        assert_eq!(status.present_today, Some(1));
        assert_eq!(status.total_enrolled, 2);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["totalStudents"], 2);
        assert_eq!(json["recognitionRunning"], false);
        assert_eq!(json["presentToday"], 1);
    }

    #[test]
    fn test_ledger_failure_degrades_status() {
        let (agg, ledger, _) = aggregator();
        ledger.set_failing(true);
        let status = agg.current_status();
        assert_eq!(status.present_today, None);
        assert!(agg.stats(7).is_err());
    }

    #[test]
    fn test_stats() {
        let (agg, ledger, store) = aggregator();
        let today = agg.clock.today();
        let ids: Vec<_> = (0..3)
            .map(|i| {
                store
                    .enroll(&format!("p{i}"), Encoding::new(vec![i as f32, 0.0]))
                    .unwrap()
                    .id
            })
            .collect();
        ledger.record_if_absent(ids[0], today, Utc::now()).unwrap();
        ledger
            .record_if_absent(ids[0], today.pred_opt().unwrap(), Utc::now())
            .unwrap();
        ledger
            .record_if_absent(ids[1], today.pred_opt().unwrap(), Utc::now())
            .unwrap();

        let stats = agg.stats(7).unwrap();
        assert_eq!(stats.total_students, 3);
        assert_eq!(stats.present_today, 1);
        assert_eq!(stats.absent_today, 2);
        assert_eq!(stats.attendance_rate, 33.3);
        assert_eq!(stats.daily.len(), 2);
        assert_eq!(stats.daily[0].date, today);
        assert_eq!(stats.daily[1].count, 2);
    }

    #[test]
    fn test_attendance_rate_empty_roster() {
        assert_eq!(attendance_rate(0, 0), 0.0);
        assert_eq!(attendance_rate(2, 2), 100.0);
    }
}
