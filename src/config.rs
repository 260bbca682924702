//! Process configuration, read from the environment (and an optional `.env`).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;
use crate::validation::MAX_INTERVAL;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Unit a policy's `interval` is counted in.
///
/// Production intervals are whole days; development shortens them to seconds
/// so a rotation cycle can be watched end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Days,
    Seconds,
}

impl IntervalUnit {
    /// Out-of-range intervals (rows written before validation tightened)
    /// are clamped into `1..=MAX_INTERVAL`.
    pub fn every(self, interval: i64) -> Duration {
        let n = interval.clamp(1, MAX_INTERVAL) as u64;
        match self {
            IntervalUnit::Days => Duration::from_secs(n * 24 * 60 * 60),
            IntervalUnit::Seconds => Duration::from_secs(n),
        }
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "days" | "day" => Ok(IntervalUnit::Days),
            "seconds" | "second" => Ok(IntervalUnit::Seconds),
            other => Err(AppError::Validation(format!(
                "ROTATION_INTERVAL_UNIT must be 'days' or 'seconds', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Base64 32-byte root key. Preferred for new writes when present.
    pub root_encryption_key: Option<String>,
    /// Legacy 32-character hex key. Still needed to read old records.
    pub legacy_encryption_key: Option<String>,
    pub interval_unit: IntervalUnit,
    pub http_timeout: Duration,
    pub db_connect_timeout: Duration,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl AppConfig {
    /// Load from the process environment. A `.env` file in the working
    /// directory is honoured but never required.
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let root_encryption_key = get("ROOT_ENCRYPTION_KEY");
        let legacy_encryption_key = get("ENCRYPTION_KEY");
        if root_encryption_key.is_none() && legacy_encryption_key.is_none() {
            return Err(AppError::Validation(
                "Either ROOT_ENCRYPTION_KEY or ENCRYPTION_KEY must be set".into(),
            ));
        }

        let interval_unit = match get("ROTATION_INTERVAL_UNIT") {
            Some(v) => v.parse()?,
            None => IntervalUnit::Days,
        };

        Ok(Self {
            data_dir: get("ROTATION_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            root_encryption_key,
            legacy_encryption_key,
            interval_unit,
            http_timeout: Duration::from_secs(parse_secs(
                get("ROTATION_HTTP_TIMEOUT_SECS"),
                "ROTATION_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            db_connect_timeout: Duration::from_secs(parse_secs(
                get("ROTATION_DB_CONNECT_TIMEOUT_SECS"),
                "ROTATION_DB_CONNECT_TIMEOUT_SECS",
                DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            )?),
            webhook_url: get("ROTATION_WEBHOOK_URL"),
            webhook_secret: get("ROTATION_WEBHOOK_SECRET"),
        })
    }
}

fn parse_secs(raw: Option<String>, key: &str, default: u64) -> Result<u64, AppError> {
    match raw {
        None => Ok(default),
        Some(v) => match v.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(AppError::Validation(format!(
                "{key} must be a positive number of seconds"
            ))),
            Ok(n) => Ok(n),
        },
    }
}
