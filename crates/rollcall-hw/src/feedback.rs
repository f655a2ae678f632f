//! LED/buzzer feedback board over a serial line.
//!
//! Wire format: one ASCII line per event, `<led><beep>\n`, where led is one of
//! `G`/`R`/`A`/`O` (green, red, amber, off) and beep is `S`/`L`/`-`
//! (short, long, none).

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("feedback hardware disabled")]
    Disabled,
    #[error("feedback device not connected")]
    Disconnected,
    #[error("failed to open {0}: {1}")]
    Open(String, std::io::Error),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
    #[error("termios configuration failed: {0}")]
    Termios(std::io::Error),
    #[error("serial write failed: {0}")]
    Write(std::io::Error),
}

/// Recognition outcome classes that have a feedback pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackKind {
    Matched,
    Unmatched,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    Green,
    Red,
    Amber,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Beep {
    Short,
    Long,
    None,
}

/// What the board should do for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackPattern {
    pub led: LedColor,
    pub beep: Beep,
}

impl FeedbackPattern {
    pub const fn new(led: LedColor, beep: Beep) -> Self {
        Self { led, beep }
    }

    pub fn wire_line(&self) -> [u8; 3] {
        let led = match self.led {
            LedColor::Green => b'G',
            LedColor::Red => b'R',
            LedColor::Amber => b'A',
            LedColor::Off => b'O',
        };
        let beep = match self.beep {
            Beep::Short => b'S',
            Beep::Long => b'L',
            Beep::None => b'-',
        };
        [led, beep, b'\n']
    }
}

/// Destination for feedback events. Called only from the delivery thread.
pub trait FeedbackSink: Send {
    fn deliver(&mut self, pattern: &FeedbackPattern) -> Result<(), HardwareError>;
    fn is_connected(&self) -> bool;
}

/// Sink used when no feedback device is configured; every event is dropped.
pub struct NullSink;

impl FeedbackSink for NullSink {
    fn deliver(&mut self, _pattern: &FeedbackPattern) -> Result<(), HardwareError> {
        Err(HardwareError::Disabled)
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Raw serial tty sink (e.g. an Arduino on /dev/ttyACM0).
///
/// The port is opened lazily and reopened after a failure, but no more often
/// than `reconnect_interval`. Events arriving while disconnected are rejected.
pub struct SerialSink {
    path: String,
    baud: u32,
    port: Option<File>,
    last_attempt: Option<Instant>,
    reconnect_interval: Duration,
    /// Pause after opening while the board resets.
    settle: Duration,
}

impl SerialSink {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            port: None,
            last_attempt: None,
            reconnect_interval: Duration::from_secs(5),
            settle: Duration::from_secs(2),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Try to open the port now, regardless of the reconnect throttle.
    pub fn connect(&mut self) -> Result<(), HardwareError> {
        self.last_attempt = Some(Instant::now());
        let file = open_tty(&self.path, self.baud)?;
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        tracing::info!(device = %self.path, baud = self.baud, "feedback board connected");
        self.port = Some(file);
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<&mut File, HardwareError> {
        if self.port.is_none() {
            let throttled = self
                .last_attempt
                .is_some_and(|t| t.elapsed() < self.reconnect_interval);
            if throttled {
                return Err(HardwareError::Disconnected);
            }
            self.connect()?;
        }
        self.port.as_mut().ok_or(HardwareError::Disconnected)
    }
}

impl FeedbackSink for SerialSink {
    fn deliver(&mut self, pattern: &FeedbackPattern) -> Result<(), HardwareError> {
        let port = self.ensure_connected()?;
        let line = pattern.wire_line();
        let written = port.write_all(&line).and_then(|_| port.flush());
        if let Err(e) = written {
            tracing::warn!(device = %self.path, error = %e, "feedback write failed; closing port");
            self.port = None;
            return Err(HardwareError::Write(e));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    match baud {
        1200 => Some(libc::B1200),
        2400 => Some(libc::B2400),
        4800 => Some(libc::B4800),
        9600 => Some(libc::B9600),
        19200 => Some(libc::B19200),
        38400 => Some(libc::B38400),
        57600 => Some(libc::B57600),
        115200 => Some(libc::B115200),
        _ => None,
    }
}

/// Open a tty in raw 8N1 mode at `baud`.
fn open_tty(path: &str, baud: u32) -> Result<File, HardwareError> {
    let speed = baud_constant(baud).ok_or(HardwareError::UnsupportedBaud(baud))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(|e| HardwareError::Open(path.to_string(), e))?;
    let fd = file.as_raw_fd();

    // SAFETY: termios is a plain C struct; all-zero is a valid bit pattern and
    // tcgetattr overwrites it before use.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: fd is valid for the lifetime of `file`; `tio` is a valid,
    // exclusively borrowed termios for the duration of each call.
    let rc = unsafe { libc::tcgetattr(fd, &mut tio) };
    if rc != 0 {
        return Err(HardwareError::Termios(std::io::Error::last_os_error()));
    }

    // SAFETY: as above; these only mutate `tio` in memory.
    unsafe {
        libc::cfmakeraw(&mut tio);
        libc::cfsetispeed(&mut tio, speed);
        libc::cfsetospeed(&mut tio, speed);
    }
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;

    // SAFETY: fd is valid; `tio` was initialised by tcgetattr above.
    let rc = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) };
    if rc != 0 {
        return Err(HardwareError::Termios(std::io::Error::last_os_error()));
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_line() {
        let green = FeedbackPattern::new(LedColor::Green, Beep::Short);
        let red = FeedbackPattern::new(LedColor::Red, Beep::Long);
        let amber = FeedbackPattern::new(LedColor::Amber, Beep::None);
        assert_eq!(&green.wire_line(), b"GS\n");
        assert_eq!(&red.wire_line(), b"RL\n");
        assert_eq!(&amber.wire_line(), b"A-\n");
    }

    #[test]
    fn test_baud_table() {
        assert_eq!(baud_constant(9600), Some(libc::B9600));
        assert_eq!(baud_constant(115200), Some(libc::B115200));
        assert_eq!(baud_constant(12345), None);
    }

    #[test]
    fn test_null_sink_drops() {
        let mut sink = NullSink;
        let pattern = FeedbackPattern::new(LedColor::Green, Beep::Short);
        assert!(matches!(sink.deliver(&pattern), Err(HardwareError::Disabled)));
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_serial_missing_device_is_throttled() {
        let mut sink = SerialSink::new("/dev/rollcall-no-such-tty", 9600)
            .with_settle(Duration::ZERO)
            .with_reconnect_interval(Duration::from_secs(60));
        let pattern = FeedbackPattern::new(LedColor::Red, Beep::Long);

        assert!(matches!(sink.deliver(&pattern), Err(HardwareError::Open(..))));
        // Second attempt inside the reconnect window does not touch the device.
        assert!(matches!(sink.deliver(&pattern), Err(HardwareError::Disconnected)));
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_serial_rejects_non_tty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let mut sink = SerialSink::new(path, 9600).with_settle(Duration::ZERO);
        assert!(matches!(sink.connect(), Err(HardwareError::Termios(_))));
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_unsupported_baud() {
        let mut sink = SerialSink::new("/dev/null", 12345).with_settle(Duration::ZERO);
        assert!(matches!(sink.connect(), Err(HardwareError::UnsupportedBaud(12345))));
    }
}
