//! Agent configuration loaded from the environment.
//!
//! All knobs come from `FLEETD_*` environment variables (a `.env` file is
//! honored via dotenvy in `main`). Intervals are overridable mainly so tests
//! can run the periodic jobs at millisecond scale.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default check-in / task poll interval.
const DEFAULT_TASK_POLL: Duration = Duration::from_secs(30);
/// Default lightweight telemetry interval.
const DEFAULT_TELEMETRY: Duration = Duration::from_secs(15 * 60);
/// Default full device-data report interval.
const DEFAULT_DEVICE_REPORT: Duration = Duration::from_secs(5 * 60);
/// Default heartbeat interval.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60 * 60);
/// Default per-request HTTP timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration for the agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the control plane, without a trailing slash.
    pub base_url: String,
    /// Service API key for unauthenticated endpoints (enroll, token refresh).
    pub api_key: SecretString,
    /// Namespace for secret-store keys, so multiple installations can coexist.
    pub namespace: String,
    /// Directory for the file-backed secret store and key material.
    pub data_dir: PathBuf,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Interval between task polls.
    pub task_poll_interval: Duration,
    /// Interval between telemetry sends.
    pub telemetry_interval: Duration,
    /// Interval between full device-data reports.
    pub device_report_interval: Duration,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = require("FLEETD_BASE_URL")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "FLEETD_BASE_URL",
                detail: format!("expected an http(s) URL, got '{base_url}'"),
            });
        }

        let api_key = SecretString::from(require("FLEETD_API_KEY")?);

        let namespace =
            std::env::var("FLEETD_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let data_dir = match std::env::var("FLEETD_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleetd"),
        };

        Ok(Self {
            base_url,
            api_key,
            namespace,
            data_dir,
            request_timeout: duration_var("FLEETD_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT)?,
            task_poll_interval: duration_var("FLEETD_TASK_POLL_SECS", DEFAULT_TASK_POLL)?,
            telemetry_interval: duration_var("FLEETD_TELEMETRY_SECS", DEFAULT_TELEMETRY)?,
            device_report_interval: duration_var(
                "FLEETD_DEVICE_REPORT_SECS",
                DEFAULT_DEVICE_REPORT,
            )?,
            heartbeat_interval: duration_var("FLEETD_HEARTBEAT_SECS", DEFAULT_HEARTBEAT)?,
        })
    }

    /// Build a config pointed at an arbitrary base URL with defaults
    /// elsewhere. Used by tests and the status command.
    pub fn for_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.into()),
            namespace: "default".to_string(),
            data_dir: std::env::temp_dir().join("fleetd"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            task_poll_interval: DEFAULT_TASK_POLL,
            telemetry_interval: DEFAULT_TELEMETRY,
            device_report_interval: DEFAULT_DEVICE_REPORT,
            heartbeat_interval: DEFAULT_HEARTBEAT,
        }
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn duration_var(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                var,
                detail: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_base_url_strips_trailing_slash() {
        let config = Config::for_base_url("https://fleet.example.com/", "key");
        assert_eq!(config.base_url, "https://fleet.example.com");
    }

    #[test]
    fn test_defaults() {
        let config = Config::for_base_url("http://localhost:9999", "key");
        assert_eq!(config.task_poll_interval, Duration::from_secs(30));
        assert_eq!(config.telemetry_interval, Duration::from_secs(900));
        assert_eq!(config.device_report_interval, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3600));
    }
}
