//! Recognition loop: a dedicated worker thread that owns the camera, the face
//! encoder and the session dedupe gate.
//!
//! Everything else talks to it through a [`LoopController`]: start/stop and
//! capture requests go over a command channel, and the current [`LoopState`]
//! is published on a watch channel that readers sample at any rate.
//! Commands are only handled between frames, so a stop never interrupts a
//! half-processed frame or commit.

use crate::ledger::{AttendanceLedger, CommitOutcome, LedgerError};
use crate::signaler::{HardwareSignaler, SignalOutcome};
use crate::store::EncodingStore;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{
    DayClock, Detection, EncodedFace, Encoding, EncoderError, FaceEncoder, IdentityId, Matcher,
    SessionDeduper,
};
use rollcall_hw::{CameraError, CameraOpener, FrameSource};
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};

const CAMERA_UNAVAILABLE: &str = "camera unavailable";
const STORE_UNAVAILABLE: &str = "attendance store unavailable";
const ENCODER_UNAVAILABLE: &str = "encoder unavailable";

/// Backoff never grows past this multiple of the base delay.
const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("only {got} usable frames captured, need {need}")]
    NotEnoughSamples { got: usize, need: usize },
    #[error("recognition loop exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Snapshot of the loop published to status readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub phase: LoopPhase,
    pub running: bool,
    pub camera_connected: bool,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            phase: LoopPhase::Stopped,
            running: false,
            camera_connected: false,
            last_frame_at: None,
            last_error: None,
        }
    }
}

/// How often feedback fires when one frame holds several detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalMode {
    /// Every detection produces a signal.
    #[default]
    PerDetection,
    /// A matched identity is signalled at most once per frame.
    PerIdentity,
}

impl FromStr for SignalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-detection" | "detection" => Ok(SignalMode::PerDetection),
            "per-identity" | "identity" => Ok(SignalMode::PerIdentity),
            other => Err(format!("unknown signal mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Minimum spacing between processed frames.
    pub process_interval: Duration,
    pub downscale: u32,
    pub commit_timeout: Duration,
    /// Consecutive camera failures tolerated before entering `Error`.
    pub max_camera_failures: u32,
    pub camera_backoff: Duration,
    pub signal_mode: SignalMode,
    pub enroll_min_samples: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_millis(1000),
            downscale: 4,
            commit_timeout: Duration::from_millis(2000),
            max_camera_failures: 5,
            camera_backoff: Duration::from_millis(200),
            signal_mode: SignalMode::PerDetection,
            enroll_min_samples: 5,
        }
    }
}

/// Collaborators the loop drives. Moved onto the worker thread.
pub struct LoopDeps {
    pub opener: Box<dyn CameraOpener>,
    pub encoder: Box<dyn FaceEncoder>,
    pub matcher: Box<dyn Matcher + Send>,
    pub store: Arc<EncodingStore>,
    pub ledger: Arc<dyn AttendanceLedger>,
    pub signaler: HardwareSignaler,
    pub clock: DayClock,
}

enum LoopCommand {
    Start {
        reply: oneshot::Sender<LoopState>,
    },
    Stop {
        reply: oneshot::Sender<LoopState>,
    },
    Capture {
        samples: usize,
        reply: oneshot::Sender<Result<Encoding, EngineError>>,
    },
}

/// Clone-safe handle to the recognition worker.
#[derive(Clone)]
pub struct LoopController {
    tx: mpsc::Sender<LoopCommand>,
    state: watch::Receiver<LoopState>,
}

impl LoopController {
    /// Start recognition. Returns the resulting state; a no-op when already running.
    pub async fn start(&self) -> Result<LoopState, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LoopCommand::Start { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Stop after the in-flight frame completes. A no-op when already stopped.
    pub async fn stop(&self) -> Result<LoopState, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LoopCommand::Stop { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Capture `samples` single-face frames and return their mean encoding.
    pub async fn capture_encoding(&self, samples: usize) -> Result<Encoding, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LoopCommand::Capture { samples, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    async fn send(&self, cmd: LoopCommand) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the recognition worker on a dedicated OS thread, initially stopped.
///
/// The thread exits once every [`LoopController`] is dropped.
pub fn spawn_loop(
    deps: LoopDeps,
    settings: LoopSettings,
) -> std::io::Result<(LoopController, JoinHandle<()>)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let (tx, rx) = mpsc::channel::<LoopCommand>(8);
    let (state_tx, state_rx) = watch::channel(LoopState::default());

    let worker = RecognitionLoop {
        deps,
        settings,
        state: state_tx,
        camera: None,
        deduper: SessionDeduper::new(),
        camera_failures: 0,
        encoder_failing: false,
        next_frame_at: Instant::now(),
    };

    let handle = std::thread::Builder::new()
        .name("rollcall-recognition".into())
        .spawn(move || worker.run(rx, runtime))?;

    Ok((
        LoopController {
            tx,
            state: state_rx,
        },
        handle,
    ))
}

struct RecognitionLoop {
    deps: LoopDeps,
    settings: LoopSettings,
    state: watch::Sender<LoopState>,
    camera: Option<Box<dyn FrameSource>>,
    deduper: SessionDeduper,
    camera_failures: u32,
    encoder_failing: bool,
    next_frame_at: Instant,
}

impl RecognitionLoop {
    fn run(mut self, mut rx: mpsc::Receiver<LoopCommand>, runtime: Runtime) {
        tracing::info!("recognition thread started");
        loop {
            let command = if self.is_running() {
                let wait = self.next_frame_at.saturating_duration_since(Instant::now());
                match runtime.block_on(tokio::time::timeout(wait, rx.recv())) {
                    Ok(Some(cmd)) => Some(cmd),
                    Ok(None) => break,
                    Err(_) => None,
                }
            } else {
                match rx.blocking_recv() {
                    Some(cmd) => Some(cmd),
                    None => break,
                }
            };

            match command {
                Some(LoopCommand::Start { reply }) => {
                    let _ = reply.send(self.start());
                }
                Some(LoopCommand::Stop { reply }) => {
                    let _ = reply.send(self.stop());
                }
                Some(LoopCommand::Capture { samples, reply }) => {
                    let _ = reply.send(self.capture(samples));
                }
                None => self.tick(&runtime),
            }
        }

        self.release_camera();
        runtime.shutdown_timeout(self.settings.commit_timeout);
        tracing::info!("recognition thread exiting");
    }

    fn is_running(&self) -> bool {
        self.state.borrow().phase == LoopPhase::Running
    }

    fn snapshot(&self) -> LoopState {
        self.state.borrow().clone()
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.state.send_modify(|s| {
            s.phase = phase;
            s.running = phase == LoopPhase::Running;
        });
    }

    fn note_error(&self, message: &str) {
        self.state.send_modify(|s| s.last_error = Some(message.to_string()));
    }

    fn start(&mut self) -> LoopState {
        if self.is_running() {
            return self.snapshot();
        }

        self.set_phase(LoopPhase::Starting);
        self.state.send_modify(|s| s.last_error = None);
        self.camera_failures = 0;
        self.encoder_failing = false;
        self.reseed_deduper();

        if self.deps.store.len() == 0 {
            tracing::warn!("starting recognition with no enrolled identities");
        }

        let opened = self.open_camera();
        self.set_phase(LoopPhase::Running);
        self.next_frame_at = Instant::now();
        if let Err(e) = opened {
            self.camera_failure(e);
        }

        if self.is_running() {
            tracing::info!("recognition loop running");
        }
        self.snapshot()
    }

    fn stop(&mut self) -> LoopState {
        if !self.is_running() {
            return self.snapshot();
        }
        self.set_phase(LoopPhase::Stopping);
        self.release_camera();
        self.set_phase(LoopPhase::Stopped);
        tracing::info!(committed_today = self.deduper.len(), "recognition loop stopped");
        self.snapshot()
    }

    /// Rebuild the dedupe gate from today's ledger so a restart never re-commits.
    /// On a ledger error the in-memory gate is kept as is.
    fn reseed_deduper(&mut self) {
        let today = self.deps.clock.today();
        match self.deps.ledger.list_for_date(today) {
            Ok(records) => {
                self.deduper = SessionDeduper::seeded(today, records.iter().map(|r| r.identity_id));
                tracing::debug!(date = %today, seeded = self.deduper.len(), "session dedupe seeded");
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read today's attendance; keeping in-memory dedupe state");
            }
        }
    }

    fn open_camera(&mut self) -> Result<(), CameraError> {
        let camera = self.deps.opener.open()?;
        self.camera = Some(camera);
        self.state.send_modify(|s| s.camera_connected = true);
        tracing::info!("camera opened");
        Ok(())
    }

    fn release_camera(&mut self) {
        if self.camera.take().is_some() {
            tracing::debug!("camera released");
        }
        self.state.send_modify(|s| s.camera_connected = false);
    }

    fn camera_failure(&mut self, err: CameraError) {
        self.camera_failures += 1;
        self.camera = None;
        self.state.send_modify(|s| s.camera_connected = false);

        if self.camera_failures >= self.settings.max_camera_failures {
            tracing::error!(
                failures = self.camera_failures,
                error = %err,
                "camera failed repeatedly; stopping recognition"
            );
            self.note_error(CAMERA_UNAVAILABLE);
            self.set_phase(LoopPhase::Error);
            self.deps.signaler.signal(SignalOutcome::Error);
            self.release_camera();
            self.set_phase(LoopPhase::Stopped);
            return;
        }

        let factor = 1u32
            .checked_shl(self.camera_failures - 1)
            .unwrap_or(MAX_BACKOFF_FACTOR)
            .min(MAX_BACKOFF_FACTOR);
        let backoff = self.settings.camera_backoff * factor;
        tracing::warn!(
            failures = self.camera_failures,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "camera failure; retrying"
        );
        self.next_frame_at = Instant::now() + backoff;
    }

    /// Process one frame.
    fn tick(&mut self, runtime: &Runtime) {
        self.next_frame_at = Instant::now() + self.settings.process_interval;

        if self.camera.is_none() {
            if let Err(e) = self.open_camera() {
                self.camera_failure(e);
                return;
            }
        }
        let captured = match self.camera.as_mut() {
            Some(camera) => camera.capture_frame(),
            None => return,
        };
        let frame = match captured {
            Ok(frame) => frame,
            Err(e) => {
                self.camera_failure(e);
                return;
            }
        };

        if self.camera_failures > 0 {
            tracing::info!(after = self.camera_failures, "camera recovered");
            self.camera_failures = 0;
        }
        self.state.send_modify(|s| {
            s.camera_connected = true;
            s.last_frame_at = Some(frame.captured_at);
        });

        if frame.is_dark {
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            return;
        }

        let scaled = frame.downscaled(self.settings.downscale);
        let faces = match self
            .deps
            .encoder
            .detect_and_encode(&scaled.data, scaled.width, scaled.height)
        {
            Ok(faces) => {
                self.encoder_failing = false;
                faces
            }
            Err(e) => {
                // Amber once per failure streak, not once per frame.
                if !self.encoder_failing {
                    tracing::warn!(error = %e, "face encoder failed");
                    self.deps.signaler.signal(SignalOutcome::Error);
                    self.note_error(ENCODER_UNAVAILABLE);
                }
                self.encoder_failing = true;
                return;
            }
        };

        if !faces.is_empty() {
            tracing::debug!(sequence = frame.sequence, faces = faces.len(), "faces detected");
            self.process_faces(faces, frame.captured_at, runtime);
        }
    }

    fn process_faces(&mut self, faces: Vec<EncodedFace>, seen_at: DateTime<Utc>, runtime: &Runtime) {
        // One snapshot per batch; enrollments during the batch apply to the next frame.
        let candidates = self.deps.store.all();
        let date = self.deps.clock.date_of(seen_at);
        let mut signalled: HashSet<IdentityId> = HashSet::new();

        for face in faces {
            let detection = Detection {
                encoding: face.encoding,
                frame_timestamp: seen_at,
                bbox: face.bbox,
            };
            let result = self.deps.matcher.compare(&detection, &candidates);

            let outcome = match result.identity_id {
                Some(id) => {
                    tracing::debug!(identity = id, distance = result.distance, "face matched");
                    self.record_sighting(id, date, seen_at, runtime)
                }
                None => {
                    tracing::debug!(distance = result.distance, "unknown face");
                    SignalOutcome::Unmatched
                }
            };

            if let SignalOutcome::Matched(id) = outcome {
                if self.settings.signal_mode == SignalMode::PerIdentity && !signalled.insert(id) {
                    continue;
                }
            }
            self.deps.signaler.signal(outcome);
        }
    }

    /// Gate a matched sighting through the deduper and commit the first one of the day.
    fn record_sighting(
        &mut self,
        id: IdentityId,
        date: NaiveDate,
        seen_at: DateTime<Utc>,
        runtime: &Runtime,
    ) -> SignalOutcome {
        if !self.deduper.should_commit(id, date) {
            return SignalOutcome::Matched(id);
        }

        match self.commit(id, date, seen_at, runtime) {
            Ok(CommitOutcome::Committed) => {
                self.deduper.mark_committed(id, date);
                tracing::info!(identity = id, date = %date, "attendance recorded");
                SignalOutcome::Matched(id)
            }
            Ok(CommitOutcome::AlreadyRecorded) => {
                self.deduper.mark_committed(id, date);
                tracing::debug!(identity = id, date = %date, "attendance already recorded");
                SignalOutcome::Matched(id)
            }
            Err(e) => {
                tracing::warn!(identity = id, error = %e, "attendance commit failed; detection skipped");
                self.note_error(STORE_UNAVAILABLE);
                SignalOutcome::Error
            }
        }
    }

    /// Ledger write bounded by the commit timeout.
    fn commit(
        &self,
        id: IdentityId,
        date: NaiveDate,
        seen_at: DateTime<Utc>,
        runtime: &Runtime,
    ) -> Result<CommitOutcome, LedgerError> {
        let ledger = Arc::clone(&self.deps.ledger);
        let limit = self.settings.commit_timeout;
        runtime.block_on(async move {
            let task =
                tokio::task::spawn_blocking(move || ledger.record_if_absent(id, date, seen_at));
            match tokio::time::timeout(limit, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(LedgerError::Unavailable(join.to_string())),
                Err(_) => Err(LedgerError::Timeout(limit)),
            }
        })
    }

    /// Collect single-face encodings for enrollment.
    ///
    /// Uses the running camera when there is one, otherwise opens it just for
    /// this capture.
    fn capture(&mut self, samples: usize) -> Result<Encoding, EngineError> {
        let need = self.settings.enroll_min_samples.min(samples).max(1);
        let borrowed = self.camera.is_some();
        let mut camera = match self.camera.take() {
            Some(camera) => camera,
            None => self.deps.opener.open()?,
        };

        let attempts = samples.saturating_mul(3);
        let mut collected: Vec<Encoding> = Vec::with_capacity(samples);
        let mut last_camera_error = None;
        let mut encoder_error = None;

        for _ in 0..attempts {
            if collected.len() >= samples {
                break;
            }
            let frame = match camera.capture_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "enroll: capture failed");
                    last_camera_error = Some(e);
                    continue;
                }
            };
            if frame.is_dark {
                continue;
            }
            let scaled = frame.downscaled(self.settings.downscale);
            let mut faces = match self
                .deps
                .encoder
                .detect_and_encode(&scaled.data, scaled.width, scaled.height)
            {
                Ok(faces) => faces,
                Err(e) => {
                    encoder_error = Some(e);
                    break;
                }
            };
            if faces.len() == 1 {
                if let Some(face) = faces.pop() {
                    collected.push(face.encoding);
                }
            }
        }

        // The running loop keeps its camera whatever happened to the capture.
        if borrowed {
            self.camera = Some(camera);
        }
        if let Some(e) = encoder_error {
            return Err(EngineError::Encoder(e));
        }

        tracing::info!(collected = collected.len(), requested = samples, "enroll: capture finished");
        if collected.is_empty() {
            if let Some(e) = last_camera_error {
                return Err(EngineError::Camera(e));
            }
        }
        if collected.len() < need {
            return Err(EngineError::NotEnoughSamples {
                got: collected.len(),
                need,
            });
        }
        Encoding::mean(&collected).ok_or(EngineError::NotEnoughSamples { got: 0, need })
    }
}
