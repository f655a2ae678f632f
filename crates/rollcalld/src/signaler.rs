//! Fire-and-forget hardware feedback.
//!
//! The recognition loop pushes outcomes into a bounded queue; a dedicated
//! delivery thread drains it into the [`FeedbackSink`]. A full queue or a
//! disconnected sink drops the event and bumps a counter.

use rollcall_core::IdentityId;
use rollcall_hw::{FeedbackKind, FeedbackSink, HardwareError, SignalMap};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Recognition outcome reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Matched(IdentityId),
    Unmatched,
    Error,
}

impl SignalOutcome {
    fn kind(self) -> FeedbackKind {
        match self {
            SignalOutcome::Matched(_) => FeedbackKind::Matched,
            SignalOutcome::Unmatched => FeedbackKind::Unmatched,
            SignalOutcome::Error => FeedbackKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub connected: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    connected: AtomicBool,
}

/// Clone-safe producer handle.
#[derive(Clone)]
pub struct HardwareSignaler {
    tx: mpsc::Sender<SignalOutcome>,
    counters: Arc<Counters>,
}

impl HardwareSignaler {
    /// Start the delivery thread. It exits once every handle is dropped.
    pub fn spawn(
        mut sink: Box<dyn FeedbackSink>,
        map: SignalMap,
        capacity: usize,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel::<SignalOutcome>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);

        let handle = std::thread::Builder::new()
            .name("rollcall-feedback".into())
            .spawn(move || {
                tracing::debug!("feedback delivery thread started");
                while let Some(outcome) = rx.blocking_recv() {
                    let pattern = map.pattern(outcome.kind());
                    match sink.deliver(&pattern) {
                        Ok(()) => {
                            worker_counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(HardwareError::Disabled) => {
                            worker_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(error = %e, ?outcome, "feedback dropped");
                        }
                    }
                    worker_counters
                        .connected
                        .store(sink.is_connected(), Ordering::Relaxed);
                }
                tracing::debug!("feedback delivery thread exiting");
            })?;

        Ok((Self { tx, counters }, handle))
    }

    /// Enqueue an outcome. Never blocks; drops when the queue is full.
    pub fn signal(&self, outcome: SignalOutcome) {
        match self.tx.try_send(outcome) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(?outcome, dropped, "feedback queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> FeedbackStats {
        FeedbackStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            connected: self.counters.connected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use rollcall_hw::{Beep, FeedbackPattern, LedColor, NullSink};
    use std::time::Duration;

    #[test]
    fn test_delivers_mapped_patterns() {
        let sink = RecordingSink::new();
        let (signaler, handle) =
            HardwareSignaler::spawn(Box::new(sink.clone()), SignalMap::default(), 8).unwrap();

        signaler.signal(SignalOutcome::Matched(1));
        signaler.signal(SignalOutcome::Unmatched);
        signaler.signal(SignalOutcome::Error);
        drop(signaler);
        handle.join().unwrap();

        assert_eq!(
            sink.patterns(),
            vec![
                FeedbackPattern::new(LedColor::Green, Beep::Short),
                FeedbackPattern::new(LedColor::Red, Beep::Long),
                FeedbackPattern::new(LedColor::Amber, Beep::None),
            ]
        );
    }

    #[test]
    fn test_disconnected_sink_counts_drops() {
        let (signaler, handle) =
            HardwareSignaler::spawn(Box::new(NullSink), SignalMap::default(), 8).unwrap();
        signaler.signal(SignalOutcome::Unmatched);
        signaler.signal(SignalOutcome::Unmatched);

        for _ in 0..200 {
            if signaler.stats().dropped == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let stats = signaler.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.delivered, 0);
        assert!(!stats.connected);
        drop(signaler);
        handle.join().unwrap();
    }

    #[test]
    fn test_full_queue_never_blocks() {
        let sink = RecordingSink::blocked();
        let (signaler, handle) =
            HardwareSignaler::spawn(Box::new(sink.clone()), SignalMap::default(), 1).unwrap();

        // The worker holds one event inside the blocked sink, the queue holds
        // one more, the rest are dropped without waiting.
        for _ in 0..50 {
            signaler.signal(SignalOutcome::Matched(3));
        }
        let stats = signaler.stats();
        assert!(stats.dropped >= 48, "dropped {}", stats.dropped);
        assert_eq!(stats.enqueued + stats.dropped, 50);

        sink.release();
        drop(signaler);
        handle.join().unwrap();
    }
}
