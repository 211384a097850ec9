use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File read when `ROLLCALL_CONFIG` is not set. Optional.
pub const DEFAULT_CONFIG_FILE: &str = "rollcall.toml";

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Configuration shared by the daemon and the CLI: defaults, then an
/// optional TOML file, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// One reference image per known person, named `<label>.<ext>`.
    pub known_faces_dir: PathBuf,
    /// Per-day attendance CSV files.
    pub logs_dir: PathBuf,
    /// Euclidean distance below which a face is accepted.
    pub match_threshold: f32,
    /// Target period of the sampling loop.
    pub tick_interval_ms: u64,
    /// Recent attendance lines kept for `RecentLog`.
    pub recent_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: default_model_dir(),
            known_faces_dir: PathBuf::from("known_faces"),
            logs_dir: PathBuf::from("attendance_logs"),
            match_threshold: 1.0,
            tick_interval_ms: 33,
            recent_log_capacity: 200,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (or `./rollcall.toml` if present) and
    /// the environment.
    ///
    /// An explicitly named config file must exist; the default one may be
    /// absent.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, required) = match std::env::var("ROLLCALL_CONFIG") {
            Ok(p) => (PathBuf::from(p), true),
            Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if required || path.exists() {
            let config = Self::from_file(&path)?;
            tracing::info!(path = %path.display(), "config file loaded");
            config
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ROLLCALL_*` variables.
    ///
    /// Unparseable numbers keep the current value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_LOGS_DIR") {
            self.logs_dir = PathBuf::from(v);
        }
        self.match_threshold =
            parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.tick_interval_ms =
            parsed(&lookup, "ROLLCALL_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.recent_log_capacity =
            parsed(&lookup, "ROLLCALL_RECENT_LOG_CAPACITY", self.recent_log_capacity);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(RECOGNIZER_MODEL_FILE)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            current
        }),
        None => current,
    }
}
