//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
/// Share of near-black pixels above which a frame counts as dark.
const DARK_FRAME_RATIO: f32 = 0.95;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
}

/// Anything the recognition loop can pull frames from.
pub trait FrameSource: Send {
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens a fresh [`FrameSource`] each time the recognition loop starts.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// A V4L2 node that advertises video capture.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// Packed 4:2:2; only the Y samples are kept.
    Yuyv,
    /// 8-bit luma, used as is.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// An opened V4L2 camera producing grayscale frames.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    /// Upper bound on waiting for one buffer to be dequeued.
    frame_timeout: Duration,
}

impl Camera {
    /// Open `device_path` and negotiate a grayscale-convertible format.
    pub fn open(device_path: &str, frame_timeout: Duration) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("{device_path}: query caps: {e}")))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let (fourcc, pixel_format, width, height) = negotiate(&device)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            fourcc = ?fourcc,
            "camera ready"
        );

        Ok(Self {
            device,
            width,
            height,
            fourcc,
            pixel_format,
            frame_timeout,
        })
    }

    /// Capture one frame, converted to grayscale.
    pub fn capture(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        stream.set_timeout(self.frame_timeout);

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let data = self.luma(buf)?;

        Ok(Frame {
            is_dark: frame::is_mostly_dark(&data, DARK_FRAME_RATIO),
            data,
            width: self.width,
            height: self.height,
            captured_at: Utc::now(),
            sequence: meta.sequence,
        })
    }

    fn luma(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::luma_from_yuyv(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(e.to_string())),
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!(
                        "short GREY buffer: {} of {pixels} bytes",
                        buf.len()
                    ))
                })
            }
        }
    }

    /// Capture-capable nodes among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<CaptureDevice> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(CapFlags::VIDEO_CAPTURE)
                    .then(|| CaptureDevice {
                        path,
                        card: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture()
    }
}

fn open_error(path: &str, err: std::io::Error) -> CameraError {
    if err.raw_os_error() == Some(libc::EBUSY) {
        CameraError::DeviceBusy(path.to_string())
    } else {
        CameraError::DeviceNotFound(format!("{path}: {err}"))
    }
}

/// Ask for YUYV, then GREY, at the capture resolution; accept whichever the
/// driver settles on as long as we can turn it into luma.
fn negotiate(device: &Device) -> Result<(FourCC, PixelFormat, u32, u32), CameraError> {
    let mut last = None;
    for wanted in [b"YUYV", b"GREY"] {
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(wanted);
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let got = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
        if let Some(pixel_format) = PixelFormat::from_fourcc(got.fourcc) {
            return Ok((got.fourcc, pixel_format, got.width, got.height));
        }
        last = Some(got.fourcc);
    }
    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offers {last:?}, need YUYV or GREY"
    )))
}

/// Opens the configured V4L2 device on every loop start.
pub struct V4lOpener {
    pub device_path: String,
    pub frame_timeout: Duration,
}

impl V4lOpener {
    pub fn new(device_path: impl Into<String>, frame_timeout: Duration) -> Self {
        Self {
            device_path: device_path.into(),
            frame_timeout,
        }
    }
}

impl CameraOpener for V4lOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device_path, self.frame_timeout)?;
        Ok(Box::new(camera))
    }
}
