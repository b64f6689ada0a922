use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

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

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after opening the camera.
    pub warmup_frames: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a probe matches a reference.
    pub tolerance: f32,
    /// References kept per identity.
    pub group_size: usize,
    /// How long a stop waits for the capture worker to finish.
    pub stop_timeout_ms: u64,
    pub ledger_queue_capacity: usize,
    pub ledger_retries: u32,
    /// Consecutive failed reads before a session gives up on its camera.
    pub max_consecutive_failures: u32,
    /// Attach a JPEG of the frame to each snapshot.
    pub preview: bool,
    pub preview_quality: u8,
    /// Face provider helper: program followed by its arguments.
    pub provider_command: Vec<String>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            warmup_frames: 4,
            db_path: data_dir().join("attendance.db"),
            tolerance: rollcall_core::matcher::DEFAULT_TOLERANCE,
            group_size: rollcall_core::catalog::DEFAULT_GROUP_SIZE,
            stop_timeout_ms: 5000,
            ledger_queue_capacity: 256,
            ledger_retries: 3,
            max_consecutive_failures: 30,
            preview: false,
            preview_quality: 70,
            provider_command: vec!["rollcall-provider".to_string()],
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load the config file named by `ROLLCALL_CONFIG` (or the default
    /// location, if present) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are ignored with a
    /// warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_PROVIDER_COMMAND") {
            self.provider_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("ROLLCALL_BUS") {
            match v.as_str() {
                "system" => self.bus = BusKind::System,
                "session" => self.bus = BusKind::Session,
                other => tracing::warn!(value = other, "ignoring ROLLCALL_BUS"),
            }
        }
        if let Some(v) = lookup("ROLLCALL_PREVIEW") {
            self.preview = v != "0";
        }

        override_parsed(&lookup, "ROLLCALL_WIDTH", &mut self.width);
        override_parsed(&lookup, "ROLLCALL_HEIGHT", &mut self.height);
        override_parsed(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "ROLLCALL_TOLERANCE", &mut self.tolerance);
        override_parsed(&lookup, "ROLLCALL_GROUP_SIZE", &mut self.group_size);
        override_parsed(&lookup, "ROLLCALL_STOP_TIMEOUT_MS", &mut self.stop_timeout_ms);
        override_parsed(&lookup, "ROLLCALL_LEDGER_QUEUE_CAPACITY", &mut self.ledger_queue_capacity);
        override_parsed(&lookup, "ROLLCALL_LEDGER_RETRIES", &mut self.ledger_retries);
        override_parsed(
            &lookup,
            "ROLLCALL_MAX_CONSECUTIVE_FAILURES",
            &mut self.max_consecutive_failures,
        );
        override_parsed(&lookup, "ROLLCALL_PREVIEW_QUALITY", &mut self.preview_quality);
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rollcall/rollcalld.toml")
}
