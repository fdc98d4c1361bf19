use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default cosine-distance threshold for a registered match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
/// Default cosine-distance threshold for re-identifying a visitor.
/// Looser than the registered threshold: visitor vectors are not curated.
pub const DEFAULT_VISITOR_THRESHOLD: f32 = 0.65;
pub const DEFAULT_CONFIRMATION_FRAMES: u32 = 3;
pub const DEFAULT_CACHE_TTL_SECS: i64 = 5;
pub const DEFAULT_FINGERPRINT_PRECISION: u32 = 2;
pub const DEFAULT_COOLDOWN_SECS: i64 = 5 * 60;

const MAX_FINGERPRINT_PRECISION: u32 = 6;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the attendance gate suppresses repeat marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMode {
    /// At most one record per identity per rolling cooldown window.
    #[default]
    Rolling,
    /// One record per identity per local calendar day; repeats bump its detection count.
    Daily,
}

impl AttendanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceMode::Rolling => "rolling",
            AttendanceMode::Daily => "daily",
        }
    }
}

impl FromStr for AttendanceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rolling" => Ok(AttendanceMode::Rolling),
            "daily" => Ok(AttendanceMode::Daily),
            other => Err(ConfigError::Invalid(format!(
                "attendance mode {other:?} (expected \"rolling\" or \"daily\")"
            ))),
        }
    }
}

/// Tunables for the recognition and attendance engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Registered match requires distance strictly below this.
    pub match_threshold: f32,
    /// Visitor re-identification requires distance strictly below this.
    pub visitor_threshold: f32,
    /// Consecutive observations required before a decision is trusted.
    pub confirmation_frames: u32,
    /// Silence after which a stability record is evicted.
    pub cache_ttl: Duration,
    /// Decimal places kept when quantizing a vector into a fingerprint.
    pub fingerprint_precision: u32,
    /// Rolling cooldown between two marks of the same identity.
    pub cooldown: Duration,
    pub attendance_mode: AttendanceMode,
    /// Offset used for the local date/time written on attendance records.
    pub utc_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            visitor_threshold: DEFAULT_VISITOR_THRESHOLD,
            confirmation_frames: DEFAULT_CONFIRMATION_FRAMES,
            cache_ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS),
            fingerprint_precision: DEFAULT_FINGERPRINT_PRECISION,
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
            attendance_mode: AttendanceMode::Rolling,
            utc_offset: Utc.fix(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("visitor_threshold", self.visitor_threshold),
        ] {
            if !(value > 0.0 && value <= 2.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 2], got {value}"
                )));
            }
        }
        if self.confirmation_frames == 0 {
            return Err(ConfigError::Invalid(
                "confirmation_frames must be at least 1".into(),
            ));
        }
        if self.cache_ttl <= Duration::zero() {
            return Err(ConfigError::Invalid("cache_ttl must be positive".into()));
        }
        if self.cooldown < Duration::zero() {
            return Err(ConfigError::Invalid("cooldown must not be negative".into()));
        }
        if self.fingerprint_precision > MAX_FINGERPRINT_PRECISION {
            return Err(ConfigError::Invalid(format!(
                "fingerprint_precision must be at most {MAX_FINGERPRINT_PRECISION}"
            )));
        }
        Ok(())
    }
}
