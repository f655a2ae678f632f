//! Boundary to the face detection/encoding algorithm.
//!
//! Detection and encoding are opaque to the daemon. [`CommandEncoder`] runs a
//! long-lived helper process (e.g. a dlib/face_recognition script) and talks to
//! it over stdin/stdout:
//!
//! - request: one JSON header line `{"width":W,"height":H,"format":"gray8","len":N}`
//!   followed by exactly `N` raw pixel bytes;
//! - reply: one JSON line `{"faces":[{"encoding":[...],"bbox":{...}}]}` or
//!   `{"error":"..."}`.
//!
//! Pipe I/O runs on a per-helper thread so a stalled helper can only cost the
//! caller the reply timeout; the helper is then killed and respawned.

use crate::types::{BoundingBox, Encoding};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;

/// Default bound on one helper round trip.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("no encoder command configured")]
    NotConfigured,
    #[error("failed to spawn encoder helper {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("encoder helper exited")]
    HelperExited,
    #[error("encoder pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed encoder reply: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("encoder helper reported: {0}")]
    Helper(String),
    #[error("encoder helper did not reply within {0:?}")]
    Timeout(Duration),
}

/// One face found by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFace {
    pub encoding: Encoding,
    #[serde(default)]
    pub bbox: BoundingBox,
}

/// Face detection plus encoding over a grayscale frame.
///
/// Implementations may hold state across frames, hence `&mut self`.
pub trait FaceEncoder: Send {
    fn detect_and_encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<EncodedFace>, EncoderError>;
}

/// Encoder used when no helper is configured; every frame fails with
/// [`EncoderError::NotConfigured`].
pub struct NoEncoder;

impl FaceEncoder for NoEncoder {
    fn detect_and_encode(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<EncodedFace>, EncoderError> {
        Err(EncoderError::NotConfigured)
    }
}

#[derive(Serialize)]
struct FrameHeader<'a> {
    width: u32,
    height: u32,
    format: &'a str,
    len: usize,
}

#[derive(Deserialize)]
struct EncoderReply {
    #[serde(default)]
    faces: Vec<EncodedFace>,
    #[serde(default)]
    error: Option<String>,
}

struct HelperProcess {
    child: Child,
    requests: mpsc::Sender<Vec<u8>>,
    replies: mpsc::Receiver<io::Result<String>>,
}

impl HelperProcess {
    fn spawn(program: &str, args: &[String]) -> Result<Self, EncoderError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EncoderError::Spawn(program.to_string(), e))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child);
                return Err(EncoderError::HelperExited);
            }
        };

        let (requests, request_rx) = mpsc::channel::<Vec<u8>>();
        let (reply_tx, replies) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("rollcall-encoder-io".into())
            .spawn(move || pump(stdin, BufReader::new(stdout), request_rx, reply_tx));
        if let Err(e) = spawned {
            reap(&mut child);
            return Err(EncoderError::Spawn(program.to_string(), e));
        }
        tracing::info!(program, pid = child.id(), "encoder helper started");

        Ok(Self {
            child,
            requests,
            replies,
        })
    }

    fn exchange(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Vec<EncodedFace>, EncoderError> {
        let header = FrameHeader {
            width,
            height,
            format: "gray8",
            len: pixels.len(),
        };
        let mut request = serde_json::to_vec(&header)?;
        request.push(b'\n');
        request.extend_from_slice(pixels);
        self.requests
            .send(request)
            .map_err(|_| EncoderError::HelperExited)?;

        let line = match self.replies.recv_timeout(timeout) {
            Ok(reply) => reply?,
            Err(RecvTimeoutError::Timeout) => return Err(EncoderError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => return Err(EncoderError::HelperExited),
        };
        if line.is_empty() {
            return Err(EncoderError::HelperExited);
        }

        let reply: EncoderReply = serde_json::from_str(line.trim_end())?;
        match reply.error {
            Some(msg) => Err(EncoderError::Helper(msg)),
            None => Ok(reply.faces),
        }
    }
}

/// Write each request and read one reply line. Ends on the first pipe error,
/// at EOF, or once the owning [`HelperProcess`] is gone.
fn pump(
    mut stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    requests: mpsc::Receiver<Vec<u8>>,
    replies: mpsc::Sender<io::Result<String>>,
) {
    for request in requests {
        let reply = stdin
            .write_all(&request)
            .and_then(|()| stdin.flush())
            .and_then(|()| {
                let mut line = String::new();
                stdout.read_line(&mut line).map(|_| line)
            });
        let done = !matches!(&reply, Ok(line) if !line.is_empty());
        if replies.send(reply).is_err() || done {
            break;
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        // Killing the helper closes its pipes, which unblocks the pump thread.
        reap(&mut self.child);
    }
}

/// [`FaceEncoder`] backed by an external helper process.
///
/// The helper is spawned lazily on first use and respawned on the next frame
/// after any pipe or protocol failure, or after it misses the reply timeout.
pub struct CommandEncoder {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    helper: Option<HelperProcess>,
}

impl CommandEncoder {
    /// Build from a whitespace-separated command line.
    pub fn from_command_line(command_line: &str) -> Result<Self, EncoderError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(EncoderError::NotConfigured)?;
        Ok(Self::with_args(program, parts.collect()))
    }

    pub fn with_args(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_REPLY_TIMEOUT,
            helper: None,
        }
    }

    /// Bound on one round trip (request written, reply line read).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl FaceEncoder for CommandEncoder {
    fn detect_and_encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<EncodedFace>, EncoderError> {
        let helper = match self.helper.take() {
            Some(h) => h,
            None => HelperProcess::spawn(&self.program, &self.args)?,
        };
        let helper = self.helper.insert(helper);

        let result = helper.exchange(pixels, width, height, self.timeout);
        // A helper-reported error leaves the pipe in sync; anything else does not.
        match &result {
            Err(EncoderError::Timeout(limit)) => {
                tracing::warn!(
                    program = %self.program,
                    timeout_ms = limit.as_millis() as u64,
                    "encoder helper stalled; killing it"
                );
                self.helper = None;
            }
            Err(EncoderError::Io(_) | EncoderError::Protocol(_) | EncoderError::HelperExited) => {
                tracing::warn!(program = %self.program, "encoder helper pipe broken; will respawn");
                self.helper = None;
            }
            _ => {}
        }
        result
    }
}
