//! rollcall-hw: camera capture and the feedback board.
//!
//! Provides V4L2-based frame capture behind the [`FrameSource`] trait and a
//! serial LED/buzzer sink behind [`FeedbackSink`].

pub mod camera;
pub mod feedback;
pub mod frame;
pub mod signal_map;

pub use camera::{Camera, CameraError, CameraOpener, FrameSource, V4lOpener};
pub use feedback::{
    Beep, FeedbackKind, FeedbackPattern, FeedbackSink, HardwareError, LedColor, NullSink,
    SerialSink,
};
pub use frame::Frame;
pub use signal_map::SignalMap;
