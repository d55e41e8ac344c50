use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enrolled reference encodings (JSON artifact from enrollment).
    pub encodings_path: PathBuf,
    /// Attendance ledger CSV.
    pub ledger_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub tolerance: f32,
    /// `first` (enumeration order wins) or `nearest`.
    pub match_policy: String,
    /// Directory of frames replayed as the camera feed.
    pub frame_dir: PathBuf,
    /// Precomputed detections for the replayed frames.
    pub trace_path: PathBuf,
    /// Delay between frame acquisitions.
    pub frame_interval: Duration,
    /// Back-off after an unavailable frame.
    pub retry_delay: Duration,
    /// Where to write the latest annotated frame, if anywhere.
    pub preview_path: Option<PathBuf>,
    /// Start a recognition session as soon as the daemon is up.
    pub autostart: bool,
    /// Quarantine a corrupt ledger and start empty instead of refusing to run.
    pub rebuild_corrupt_ledger: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = rollcall_core::default_data_dir();

        Self {
            encodings_path: rollcall_core::default_encodings_path(),
            ledger_path: rollcall_core::default_ledger_path(),
            tolerance: env_f32("ROLLCALL_TOLERANCE", rollcall_core::DEFAULT_TOLERANCE),
            match_policy: std::env::var("ROLLCALL_MATCH_POLICY")
                .unwrap_or_else(|_| "first".to_string()),
            frame_dir: env_path("ROLLCALL_FRAME_DIR")
                .unwrap_or_else(|| data_dir.join("frames")),
            trace_path: env_path("ROLLCALL_TRACE_PATH")
                .unwrap_or_else(|| data_dir.join("trace.json")),
            frame_interval: Duration::from_millis(env_u64("ROLLCALL_FRAME_INTERVAL_MS", 100)),
            retry_delay: Duration::from_millis(env_u64("ROLLCALL_RETRY_DELAY_MS", 50)),
            preview_path: env_path("ROLLCALL_PREVIEW_PATH"),
            autostart: env_flag("ROLLCALL_AUTOSTART", false),
            rebuild_corrupt_ledger: env_flag("ROLLCALL_REBUILD_CORRUPT_LEDGER", false),
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(default)
}
