use anyhow::{anyhow, Result};
use rollcall_core::{DayClock, DistanceMetric, DEFAULT_REPLY_TIMEOUT};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{LoopSettings, SignalMode};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8750).
    pub listen_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Upper bound on a single frame capture.
    pub frame_timeout: Duration,
    /// Command line of the external face encoder helper.
    pub encoder_cmd: Option<String>,
    /// Longest wait for one encoder reply before the helper is killed.
    pub encoder_timeout: Duration,
    /// Length of every reference and detected encoding.
    pub encoding_dim: usize,
    /// Maximum distance that still counts as a match.
    pub match_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Timezone deciding the attendance day.
    pub timezone: DayClock,
    /// Serial device of the feedback board; `None` disables feedback.
    pub feedback_device: Option<String>,
    pub feedback_baud: u32,
    pub feedback_queue: usize,
    /// Optional TOML file overriding the embedded signal map.
    pub signal_map: Option<PathBuf>,
    pub signal_mode: SignalMode,
    pub commit_timeout: Duration,
    pub camera_max_failures: u32,
    pub camera_backoff: Duration,
    pub process_interval: Duration,
    pub downscale: u32,
    /// Frames averaged per capture enrollment when the request names none.
    pub enroll_samples: usize,
    pub enroll_min_samples: usize,
    /// Start the recognition loop as soon as the daemon is up.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let listen_addr = var("ROLLCALL_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8750".to_string());
        let listen_addr = listen_addr
            .parse()
            .map_err(|e| anyhow!("ROLLCALL_LISTEN_ADDR {listen_addr:?}: {e}"))?;

        let distance_metric = match var("ROLLCALL_DISTANCE_METRIC") {
            Some(v) => v.parse().map_err(|e| anyhow!("ROLLCALL_DISTANCE_METRIC: {e}"))?,
            None => DistanceMetric::Euclidean,
        };
        let timezone = match var("ROLLCALL_TIMEZONE") {
            Some(v) => v.parse().map_err(|e| anyhow!("ROLLCALL_TIMEZONE: {e}"))?,
            None => DayClock::Local,
        };
        let signal_mode = match var("ROLLCALL_SIGNAL_MODE") {
            Some(v) => v.parse().map_err(|e| anyhow!("ROLLCALL_SIGNAL_MODE: {e}"))?,
            None => SignalMode::PerDetection,
        };

        let num = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        // Out-of-range values fall back to the default rather than wrapping.
        let num32 = |key: &str| num(key).and_then(|v| u32::try_from(v).ok());
        let count = |key: &str| num(key).and_then(|v| usize::try_from(v).ok());
        let millis =
            |key: &str, default: u64| Duration::from_millis(num(key).unwrap_or(default).max(1));

        Ok(Self {
            listen_addr,
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            camera_device: var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_timeout: millis("ROLLCALL_FRAME_TIMEOUT_MS", 2000),
            encoder_cmd: var("ROLLCALL_ENCODER_CMD").filter(|v| !v.trim().is_empty()),
            encoder_timeout: millis(
                "ROLLCALL_ENCODER_TIMEOUT_MS",
                DEFAULT_REPLY_TIMEOUT.as_millis() as u64,
            ),
            encoding_dim: count("ROLLCALL_ENCODING_DIM").unwrap_or(128).max(1),
            match_threshold: var("ROLLCALL_MATCH_THRESHOLD")
                .and_then(|v| v.trim().parse::<f32>().ok())
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(0.5),
            distance_metric,
            timezone,
            // Set but empty means "no feedback hardware".
            feedback_device: match var("ROLLCALL_FEEDBACK_DEVICE") {
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(v),
                None => Some("/dev/ttyACM0".to_string()),
            },
            feedback_baud: num32("ROLLCALL_FEEDBACK_BAUD").filter(|b| *b > 0).unwrap_or(9600),
            feedback_queue: count("ROLLCALL_FEEDBACK_QUEUE").unwrap_or(16).max(1),
            signal_map: var("ROLLCALL_SIGNAL_MAP")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            signal_mode,
            commit_timeout: millis("ROLLCALL_COMMIT_TIMEOUT_MS", 2000),
            camera_max_failures: num32("ROLLCALL_CAMERA_MAX_FAILURES").unwrap_or(5).max(1),
            camera_backoff: Duration::from_millis(num("ROLLCALL_CAMERA_BACKOFF_MS").unwrap_or(200)),
            process_interval: Duration::from_millis(
                num("ROLLCALL_PROCESS_INTERVAL_MS").unwrap_or(1000),
            ),
            downscale: num32("ROLLCALL_DOWNSCALE").unwrap_or(4).max(1),
            enroll_samples: count("ROLLCALL_ENROLL_SAMPLES").unwrap_or(15).max(1),
            enroll_min_samples: count("ROLLCALL_ENROLL_MIN_SAMPLES").unwrap_or(5).max(1),
            autostart: var("ROLLCALL_AUTOSTART")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false),
        })
    }

    /// SQLite busy timeout for both connections. Capped at the commit timeout
    /// so an abandoned commit cannot keep the ledger lock past it.
    pub fn busy_timeout(&self) -> Duration {
        self.commit_timeout
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            process_interval: self.process_interval,
            downscale: self.downscale,
            commit_timeout: self.commit_timeout,
            max_camera_failures: self.camera_max_failures,
            camera_backoff: self.camera_backoff,
            signal_mode: self.signal_mode,
            enroll_min_samples: self.enroll_min_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("HOME", "/home/op")]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8750");
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/op/.local/share/rollcall/attendance.db")
        );
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.encoder_cmd, None);
        assert_eq!(config.encoding_dim, 128);
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.distance_metric, DistanceMetric::Euclidean);
        assert_eq!(config.timezone, DayClock::Local);
        assert_eq!(config.feedback_device.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.feedback_baud, 9600);
        assert_eq!(config.signal_mode, SignalMode::PerDetection);
        assert_eq!(config.commit_timeout, Duration::from_millis(2000));
        assert_eq!(config.busy_timeout(), config.commit_timeout);
        assert_eq!(config.encoder_timeout, DEFAULT_REPLY_TIMEOUT);
        assert_eq!(config.camera_max_failures, 5);
        assert_eq!(config.downscale, 4);
        assert_eq!(config.enroll_samples, 15);
        assert!(!config.autostart);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.6"),
            ("ROLLCALL_DISTANCE_METRIC", "cosine"),
            ("ROLLCALL_TIMEZONE", "+05:30"),
            ("ROLLCALL_FEEDBACK_DEVICE", ""),
            ("ROLLCALL_SIGNAL_MODE", "per-identity"),
            ("ROLLCALL_ENCODER_CMD", "/usr/lib/rollcall/encode --model hog"),
            ("ROLLCALL_DOWNSCALE", "0"),
            ("ROLLCALL_AUTOSTART", "1"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/attendance.db"));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.timezone, "+0530".parse::<DayClock>().unwrap());
        assert_eq!(config.feedback_device, None);
        assert_eq!(config.signal_mode, SignalMode::PerIdentity);
        assert_eq!(
            config.encoder_cmd.as_deref(),
            Some("/usr/lib/rollcall/encode --model hog")
        );
        assert_eq!(config.downscale, 1);
        assert!(config.autostart);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("ROLLCALL_TIMEZONE", "Mars/Olympus")]).is_err());
        assert!(load(&[("ROLLCALL_DISTANCE_METRIC", "manhattan")]).is_err());
        assert!(load(&[("ROLLCALL_LISTEN_ADDR", "not-an-addr")]).is_err());
        // Unparseable numbers fall back to defaults.
        let config = load(&[("ROLLCALL_MATCH_THRESHOLD", "loose")]).unwrap();
        assert_eq!(config.match_threshold, 0.5);
    }

    #[test]
    fn test_out_of_range_numbers_fall_back() {
        let config = load(&[
            ("ROLLCALL_CAMERA_MAX_FAILURES", "4294967296"),
            ("ROLLCALL_FEEDBACK_BAUD", "4294967296"),
            ("ROLLCALL_DOWNSCALE", "99999999999"),
            ("ROLLCALL_ENCODING_DIM", "-3"),
        ])
        .unwrap();
        assert_eq!(config.camera_max_failures, 5);
        assert_eq!(config.feedback_baud, 9600);
        assert_eq!(config.downscale, 4);
        assert_eq!(config.encoding_dim, 128);

        let config = load(&[("ROLLCALL_FEEDBACK_BAUD", "0")]).unwrap();
        assert_eq!(config.feedback_baud, 9600);
    }

    #[test]
    fn test_timeouts_have_a_floor() {
        let config = load(&[
            ("ROLLCALL_COMMIT_TIMEOUT_MS", "0"),
            ("ROLLCALL_ENCODER_TIMEOUT_MS", "0"),
            ("ROLLCALL_FRAME_TIMEOUT_MS", "0"),
        ])
        .unwrap();
        assert_eq!(config.commit_timeout, Duration::from_millis(1));
        assert_eq!(config.busy_timeout(), Duration::from_millis(1));
        assert_eq!(config.encoder_timeout, Duration::from_millis(1));
        assert_eq!(config.frame_timeout, Duration::from_millis(1));

        let config = load(&[
            ("ROLLCALL_COMMIT_TIMEOUT_MS", "750"),
            ("ROLLCALL_ENCODER_TIMEOUT_MS", "12000"),
        ])
        .unwrap();
        assert_eq!(config.busy_timeout(), Duration::from_millis(750));
        assert_eq!(config.encoder_timeout, Duration::from_secs(12));
    }
}
