use chrono::FixedOffset;
use rollcall_core::config::{
    AttendanceMode, EngineConfig, DEFAULT_CACHE_TTL_SECS, DEFAULT_CONFIRMATION_FRAMES,
    DEFAULT_COOLDOWN_SECS, DEFAULT_FINGERPRINT_PRECISION, DEFAULT_MATCH_THRESHOLD,
    DEFAULT_VISITOR_THRESHOLD,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Engine(#[from] rollcall_core::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Layered: built-in defaults, then the TOML file named by `ROLLCALL_CONFIG`
/// (if set), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Command line of the face extractor (frame on stdin, JSON detections on stdout).
    pub extractor_cmd: String,
    /// Cosine distance below which a face matches a registered identity.
    pub match_threshold: f32,
    /// Cosine distance below which a face matches a known visitor.
    pub visitor_threshold: f32,
    /// Observations needed before a face decision is trusted.
    pub confirmation_frames: u32,
    pub cache_ttl_secs: u64,
    pub fingerprint_precision: u32,
    /// Minimum gap between two marks of the same identity (rolling mode).
    pub cooldown_secs: u64,
    pub attendance_mode: AttendanceMode,
    /// Local offset used for attendance dates and times.
    pub utc_offset_minutes: i32,
    pub provider_timeout_ms: u64,
    /// SQLite busy timeout.
    pub storage_timeout_ms: u64,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("rollcall.db"),
            extractor_cmd: "rollcall-extract".to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            visitor_threshold: DEFAULT_VISITOR_THRESHOLD,
            confirmation_frames: DEFAULT_CONFIRMATION_FRAMES,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS as u64,
            fingerprint_precision: DEFAULT_FINGERPRINT_PRECISION,
            cooldown_secs: DEFAULT_COOLDOWN_SECS as u64,
            attendance_mode: AttendanceMode::Rolling,
            utc_offset_minutes: 0,
            provider_timeout_ms: 5000,
            storage_timeout_ms: 2000,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and `ROLLCALL_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay environment overrides. Unparseable values keep the current setting.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key);

        if let Some(path) = env("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(cmd) = env("ROLLCALL_EXTRACTOR_CMD") {
            self.extractor_cmd = cmd;
        }
        self.match_threshold = env_f32(&env, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.visitor_threshold =
            env_f32(&env, "ROLLCALL_VISITOR_THRESHOLD", self.visitor_threshold);
        self.confirmation_frames =
            env_u32(&env, "ROLLCALL_CONFIRMATION_FRAMES", self.confirmation_frames);
        self.cache_ttl_secs = env_u64(&env, "ROLLCALL_CACHE_TTL_SECS", self.cache_ttl_secs);
        self.fingerprint_precision = env_u32(
            &env,
            "ROLLCALL_FINGERPRINT_PRECISION",
            self.fingerprint_precision,
        );
        self.cooldown_secs = env_u64(&env, "ROLLCALL_COOLDOWN_SECS", self.cooldown_secs);
        if let Some(mode) = env("ROLLCALL_ATTENDANCE_MODE") {
            match mode.parse::<AttendanceMode>() {
                Ok(mode) => self.attendance_mode = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring ROLLCALL_ATTENDANCE_MODE"),
            }
        }
        self.utc_offset_minutes = env("ROLLCALL_UTC_OFFSET_MINUTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.utc_offset_minutes);
        self.provider_timeout_ms =
            env_u64(&env, "ROLLCALL_PROVIDER_TIMEOUT_MS", self.provider_timeout_ms);
        self.storage_timeout_ms =
            env_u64(&env, "ROLLCALL_STORAGE_TIMEOUT_MS", self.storage_timeout_ms);
        if let Some(v) = env("ROLLCALL_SESSION_BUS") {
            self.session_bus = v != "0";
        }
    }

    /// Engine tunables derived from this configuration, validated.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let utc_offset = self
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "utc_offset_minutes {} is out of range",
                    self.utc_offset_minutes
                ))
            })?;
        let config = EngineConfig {
            match_threshold: self.match_threshold,
            visitor_threshold: self.visitor_threshold,
            confirmation_frames: self.confirmation_frames,
            cache_ttl: seconds(self.cache_ttl_secs)?,
            fingerprint_precision: self.fingerprint_precision,
            cooldown: seconds(self.cooldown_secs)?,
            attendance_mode: self.attendance_mode,
            utc_offset,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.max(1))
    }
}

fn seconds(secs: u64) -> Result<chrono::Duration, ConfigError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| ConfigError::Invalid(format!("{secs} seconds is out of range")))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(env: impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(env: impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(env: impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_build_valid_engine_config() {
        let engine = Config::default().engine_config().unwrap();
        assert_eq!(engine.match_threshold, 0.5);
        assert_eq!(engine.visitor_threshold, 0.65);
        assert_eq!(engine.confirmation_frames, 3);
        assert_eq!(engine.cooldown, chrono::Duration::seconds(300));
        assert_eq!(engine.attendance_mode, AttendanceMode::Rolling);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/db.sqlite"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.4"),
            ("ROLLCALL_CONFIRMATION_FRAMES", "5"),
            ("ROLLCALL_ATTENDANCE_MODE", "daily"),
            ("ROLLCALL_UTC_OFFSET_MINUTES", "-300"),
            ("ROLLCALL_SESSION_BUS", "1"),
            ("ROLLCALL_COOLDOWN_SECS", "not-a-number"),
        ]));

        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/db.sqlite"));
        assert_eq!(config.match_threshold, 0.4);
        assert_eq!(config.confirmation_frames, 5);
        assert_eq!(config.attendance_mode, AttendanceMode::Daily);
        assert_eq!(config.utc_offset_minutes, -300);
        assert!(config.session_bus);
        // Unparseable values keep the previous setting.
        assert_eq!(config.cooldown_secs, 300);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.utc_offset.local_minus_utc(), -300 * 60);
    }

    #[test]
    fn test_toml_file_then_env() {
        let path = std::env::temp_dir().join(format!("rollcalld-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "extractor_cmd = \"python3 extract.py --model arcface\"\n\
             attendance_mode = \"daily\"\n\
             cache_ttl_secs = 8\n",
        )
        .unwrap();

        let mut config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.extractor_cmd, "python3 extract.py --model arcface");
        assert_eq!(config.attendance_mode, AttendanceMode::Daily);
        assert_eq!(config.cache_ttl_secs, 8);
        assert_eq!(config.cooldown_secs, 300);

        config.apply_env(vars(&[("ROLLCALL_CACHE_TTL_SECS", "2")]));
        assert_eq!(config.sweep_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let path = std::env::temp_dir().join(format!("rollcalld-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "camera_device = \"/dev/video0\"\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config {
            confirmation_frames: 0,
            ..Config::default()
        };
        assert!(matches!(config.engine_config(), Err(ConfigError::Engine(_))));

        let config = Config {
            utc_offset_minutes: 24 * 60,
            ..Config::default()
        };
        assert!(matches!(config.engine_config(), Err(ConfigError::Invalid(_))));
    }
}
