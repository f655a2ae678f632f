//! In-process fakes for driving the daemon without hardware.

use crate::ledger::{AttendanceLedger, AttendanceRecord, CommitOutcome, LedgerError, SqliteLedger};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{BoundingBox, EncodedFace, Encoding, EncoderError, FaceEncoder, IdentityId};
use rollcall_hw::{
    CameraError, CameraOpener, FeedbackPattern, FeedbackSink, Frame, FrameSource, HardwareError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub fn face(values: Vec<f32>) -> EncodedFace {
    EncodedFace {
        encoding: Encoding::new(values),
        bbox: BoundingBox::default(),
    }
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}

/// Feedback sink that records every pattern; optionally holds deliveries until released.
#[derive(Clone, Default)]
pub struct RecordingSink {
    patterns: Arc<Mutex<Vec<FeedbackPattern>>>,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocked() -> Self {
        let sink = Self::default();
        *sink.gate.0.lock().unwrap() = true;
        sink
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = false;
        cvar.notify_all();
    }

    pub fn patterns(&self) -> Vec<FeedbackPattern> {
        self.patterns.lock().unwrap().clone()
    }
}

impl FeedbackSink for RecordingSink {
    fn deliver(&mut self, pattern: &FeedbackPattern) -> Result<(), HardwareError> {
        let (lock, cvar) = &*self.gate;
        let mut blocked = lock.lock().unwrap();
        while *blocked {
            blocked = cvar.wait(blocked).unwrap();
        }
        drop(blocked);
        self.patterns.lock().unwrap().push(*pattern);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct CameraControl {
    broken: AtomicBool,
    dark: AtomicBool,
    opens: AtomicUsize,
    captures: AtomicUsize,
}

/// Camera that yields small mid-grey frames stamped with the current time.
#[derive(Clone, Default)]
pub struct FakeOpener {
    control: Arc<CameraControl>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// While broken, both opening and capturing fail.
    pub fn set_broken(&self, broken: bool) {
        self.control.broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_dark(&self, dark: bool) {
        self.control.dark.store(dark, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.control.opens.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.control.captures.load(Ordering::SeqCst)
    }
}

impl CameraOpener for FakeOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        if self.control.broken.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceNotFound("/dev/video-fake".into()));
        }
        Ok(Box::new(FakeCamera {
            control: Arc::clone(&self.control),
            sequence: AtomicU32::new(0),
        }))
    }
}

struct FakeCamera {
    control: Arc<CameraControl>,
    sequence: AtomicU32,
}

impl FrameSource for FakeCamera {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.control.broken.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("fake camera unplugged".into()));
        }
        self.control.captures.fetch_add(1, Ordering::SeqCst);
        let dark = self.control.dark.load(Ordering::SeqCst);
        Ok(Frame {
            data: vec![if dark { 2 } else { 128 }; 64],
            width: 8,
            height: 8,
            captured_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            is_dark: dark,
        })
    }
}

#[derive(Default)]
struct Scene {
    faces: Vec<EncodedFace>,
    /// Frames left that still show `faces`; afterwards the scene is empty.
    remaining: usize,
}

/// Encoder that reports a scripted scene for a fixed number of frames.
#[derive(Clone, Default)]
pub struct FakeEncoder {
    scene: Arc<Mutex<Scene>>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scene(&self, faces: Vec<EncodedFace>, frames: usize) {
        *self.scene.lock().unwrap() = Scene {
            faces,
            remaining: frames,
        };
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn scene_exhausted(&self) -> bool {
        self.scene.lock().unwrap().remaining == 0
    }
}

impl FaceEncoder for FakeEncoder {
    fn detect_and_encode(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<EncodedFace>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EncoderError::HelperExited);
        }
        let mut scene = self.scene.lock().unwrap();
        if scene.remaining == 0 {
            return Ok(Vec::new());
        }
        scene.remaining -= 1;
        Ok(scene.faces.clone())
    }
}

/// SQLite ledger that can be told to fail or stall, and remembers every attempt.
pub struct FlakyLedger {
    inner: SqliteLedger,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    read_delay: Mutex<Duration>,
    attempts: Mutex<Vec<IdentityId>>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: SqliteLedger::new(crate::db::open_in_memory()),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            read_delay: Mutex::new(Duration::ZERO),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Stall every read, like a ledger waiting on a locked database.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> Vec<IdentityId> {
        self.attempts.lock().unwrap().clone()
    }

    fn before_read(&self) -> Result<(), LedgerError> {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("disk detached".into()));
        }
        Ok(())
    }
}

impl AttendanceLedger for FlakyLedger {
    fn record_if_absent(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        seen_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, LedgerError> {
        self.attempts.lock().unwrap().push(identity);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("disk detached".into()));
        }
        self.inner.record_if_absent(identity, date, seen_at)
    }

    fn list_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.before_read()?;
        self.inner.list_for_date(date)
    }

    fn list_all(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.before_read()?;
        self.inner.list_all()
    }

    fn count_for_date(&self, date: NaiveDate) -> Result<usize, LedgerError> {
        self.before_read()?;
        self.inner.count_for_date(date)
    }

    fn daily_counts(&self, days: usize) -> Result<Vec<(NaiveDate, usize)>, LedgerError> {
        self.before_read()?;
        self.inner.daily_counts(days)
    }
}
