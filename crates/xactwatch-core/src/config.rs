//! Scan parameters and file configuration.
//!
//! Durations arrive from the outside world (CLI flags, `xactwatch.toml`) as
//! suffixed strings (`750ms`, `30s`, `10m`, `2h`) and are parsed and
//! validated here, before any scan starts. Negative or unparsable values are
//! rejected at this boundary; `std::time::Duration` cannot represent a
//! negative age past it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::report::ReportMode;

/// Parameters for a single watchdog scan.
///
/// One value of this struct describes one invocation; nothing in it is
/// retained across runs.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Report transactions older than this.
    pub min_duration: Duration,
    /// Also resolve and report the blocking session for waiting transactions.
    pub report_blockers: bool,
    /// Live emission severity, or row accumulation.
    pub report_mode: ReportMode,
    /// Start attempting cancellation past this age.
    pub cancel_after: Option<Duration>,
    /// Start attempting termination past this age, only after a failed or
    /// inapplicable cancel.
    pub terminate_after: Option<Duration>,
    /// false = touch at most one transaction per call; true = touch every
    /// qualifying transaction.
    pub cancel_all: bool,
}

impl ScanParams {
    /// Create params with the given reporting threshold and everything else
    /// at its default: no blocker detail, `notice` emission, no escalation.
    pub fn new(min_duration: Duration) -> Self {
        Self {
            min_duration,
            report_blockers: false,
            report_mode: ReportMode::Notice,
            cancel_after: None,
            terminate_after: None,
            cancel_all: false,
        }
    }

    /// Check parameter coherence before a scan.
    ///
    /// Duration values are already non-negative by type; the remaining
    /// check is advisory: a terminate threshold without a cancel threshold
    /// is inert, since termination is only ever reached after a cancel
    /// attempt.
    pub fn validate(&self) -> Result<()> {
        if self.terminate_after.is_some() && self.cancel_after.is_none() {
            tracing::warn!(
                "terminate_after is set but cancel_after is not; no escalation will occur"
            );
        }
        Ok(())
    }
}

/// Parse a suffixed duration string: `750ms`, `30s`, `10m`, `2h`.
///
/// The value must be a non-negative integer with an explicit unit. An empty
/// string, a bare number, a negative value, or an unknown unit is a config
/// error.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let (num_str, multiplier_ms) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1u64)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        return Err(Error::Config(format!(
            "duration '{s}' is missing a unit (expected ms, s, m, or h)"
        )));
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration '{s}'")))?;

    num.checked_mul(multiplier_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| Error::Config(format!("duration '{s}' overflows")))
}

fn de_duration_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Connection settings from `xactwatch.toml`.
///
/// All fields are optional; the CLI layers flag > environment > file >
/// built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub dbname: Option<String>,
}

/// Watchdog defaults from `xactwatch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    #[serde(deserialize_with = "de_duration_opt")]
    pub min_duration: Option<Duration>,
    pub report_blockers: Option<bool>,
    pub report_mode: Option<String>,
    #[serde(deserialize_with = "de_duration_opt")]
    pub cancel_after: Option<Duration>,
    #[serde(deserialize_with = "de_duration_opt")]
    pub terminate_after: Option<Duration>,
    pub cancel_all: Option<bool>,
}

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub connection: ConnectionConfig,
    pub watchdog: WatchdogConfig,
}

impl FileConfig {
    /// Load and validate a config file. Duration fields are parsed during
    /// deserialization, so a malformed value fails here, not mid-scan.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
    }

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_duration_minutes() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn parse_duration_hours() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn parse_duration_zero_allowed() {
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_negative() {
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn parse_duration_rejects_bare_number() {
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn parse_duration_rejects_empty() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("   ").is_err());
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn scan_params_defaults() {
        let params = ScanParams::new(Duration::from_secs(1));
        assert!(!params.report_blockers);
        assert_eq!(params.report_mode, ReportMode::Notice);
        assert!(params.cancel_after.is_none());
        assert!(params.terminate_after.is_none());
        assert!(!params.cancel_all);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn file_config_round_trip() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("xactwatch.toml");
        std::fs::write(
            &path,
            r#"
[connection]
host = "db.internal"
port = 5433

[watchdog]
min_duration = "30s"
report_blockers = true
report_mode = "text"
cancel_after = "10m"
cancel_all = true
"#,
        )
        .expect("write config");

        let cfg = FileConfig::load(&path).expect("load config");
        assert_eq!(cfg.connection.host.as_deref(), Some("db.internal"));
        assert_eq!(cfg.connection.port, Some(5433));
        assert_eq!(cfg.watchdog.min_duration, Some(Duration::from_secs(30)));
        assert_eq!(cfg.watchdog.report_blockers, Some(true));
        assert_eq!(cfg.watchdog.report_mode.as_deref(), Some("text"));
        assert_eq!(cfg.watchdog.cancel_after, Some(Duration::from_secs(600)));
        assert_eq!(cfg.watchdog.terminate_after, None);
        assert_eq!(cfg.watchdog.cancel_all, Some(true));
    }

    #[test]
    fn file_config_rejects_bad_duration() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("xactwatch.toml");
        std::fs::write(&path, "[watchdog]\nmin_duration = \"-5s\"\n").expect("write config");

        let err = FileConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[test]
    fn file_config_missing_file_is_io_error() {
        let err = FileConfig::load(Path::new("/nonexistent/xactwatch.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
