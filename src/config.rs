//! Configuration management for the LILITH bridge.
//!
//! Configuration can be set via environment variables:
//! - `LILITH_HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `LILITH_PORT` - Optional. Server port. Defaults to `3011`.
//! - `DISPLAY` - Optional. X11 display handed to every backend. Defaults to `:0`.
//! - `LILITH_ALLOW_CAPTURE`, `LILITH_ALLOW_MOUSE`, `LILITH_ALLOW_KEYBOARD`,
//!   `LILITH_ALLOW_WINDOW`, `LILITH_ALLOW_OCR` - Optional. Per-class permission
//!   flags. All default to `true`.
//! - `LILITH_MAX_CLICKS_PER_MINUTE` - Optional. Defaults to `60`.
//! - `LILITH_MAX_KEYSTROKES_PER_MINUTE` - Optional. Defaults to `300`.
//! - `LILITH_MAX_WINDOW_OPS_PER_MINUTE` - Optional. Defaults to `60`.
//! - `LILITH_RATE_WINDOW_SECS` - Optional. Rate window length. Defaults to `60`.
//! - `LILITH_ATTEMPT_TIMEOUT_MS` - Optional. Per-backend attempt deadline. Defaults to `5000`.
//! - `LILITH_PROBE_RETRIES` - Optional. Extra probe tries per backend. Defaults to `1`.
//! - `LILITH_PROBE_RETRY_DELAY_MS` - Optional. Defaults to `250`.
//! - `LILITH_UNION_POLICY` - Optional. `raw` or `clamp`. Defaults to `raw`.
//! - `LILITH_MONITORS` - Optional. Static geometry, e.g. `1920x1080+0+0,1280x1024+1920+0`.
//! - `LILITH_AUDIT_LOG` - Optional. JSONL file receiving every audit record.
//! - `LILITH_AUDIT_CAPACITY` - Optional. In-memory audit records kept. Defaults to `1000`.
//! - `LILITH_POLICY_FILE` - Optional. JSON policy (permissions + rate limits),
//!   re-read on `SIGHUP`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::geometry::UnionPolicy;
use crate::safety::{PermissionSet, Policy, RateLimits};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read policy file {0}: {1}")]
    PolicyFile(PathBuf, String),

    #[error("Failed to open audit log {0}: {1}")]
    AuditLog(PathBuf, String),
}

/// Probe retry policy.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Extra tries for a backend whose first exercise failed
    pub retries: u32,

    /// Pause between tries
    pub retry_delay: Duration,

    /// Deadline for a single probe exercise
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            retry_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// X11 display passed to every backend process
    pub display: String,

    /// Permissions and rate limits (hot-reloadable)
    pub policy: Policy,

    /// Deadline for each backend attempt inside the router
    pub attempt_timeout: Duration,

    /// Capability probe retry policy
    pub probe: ProbeConfig,

    /// How relative coordinates against the union frame are resolved
    pub union_policy: UnionPolicy,

    /// Static monitor geometry overriding `xrandr` enumeration
    pub static_monitors: Option<String>,

    /// Optional JSONL audit file
    pub audit_log: Option<PathBuf>,

    /// Number of audit records kept in memory
    pub audit_capacity: usize,

    /// Optional JSON policy file, re-read on reload
    pub policy_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3011,
            display: ":0".to_string(),
            policy: Policy::default(),
            attempt_timeout: Duration::from_millis(5000),
            probe: ProbeConfig::default(),
            union_policy: UnionPolicy::Raw,
            static_monitors: None,
            audit_log: None,
            audit_capacity: 1000,
            policy_file: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or enum variable
    /// cannot be parsed, or `ConfigError::PolicyFile` if `LILITH_POLICY_FILE`
    /// is set but unreadable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_limits = RateLimits::default();

        let permissions = PermissionSet {
            capture: env_var_bool("LILITH_ALLOW_CAPTURE", true),
            mouse: env_var_bool("LILITH_ALLOW_MOUSE", true),
            keyboard: env_var_bool("LILITH_ALLOW_KEYBOARD", true),
            window: env_var_bool("LILITH_ALLOW_WINDOW", true),
            ocr: env_var_bool("LILITH_ALLOW_OCR", true),
        };

        let rate_limits = RateLimits {
            max_clicks_per_minute: env_parse(
                "LILITH_MAX_CLICKS_PER_MINUTE",
                default_limits.max_clicks_per_minute,
            )?,
            max_keystrokes_per_minute: env_parse(
                "LILITH_MAX_KEYSTROKES_PER_MINUTE",
                default_limits.max_keystrokes_per_minute,
            )?,
            max_window_ops_per_minute: env_parse(
                "LILITH_MAX_WINDOW_OPS_PER_MINUTE",
                default_limits.max_window_ops_per_minute,
            )?,
            window_secs: env_parse("LILITH_RATE_WINDOW_SECS", default_limits.window_secs)?,
        };

        let policy_file = std::env::var("LILITH_POLICY_FILE").ok().map(PathBuf::from);
        let policy = match &policy_file {
            Some(path) => load_policy(path)?,
            None => Policy {
                permissions,
                rate_limits,
            },
        };

        let union_policy = match std::env::var("LILITH_UNION_POLICY") {
            Ok(v) => v
                .parse()
                .map_err(|e| ConfigError::InvalidValue("LILITH_UNION_POLICY".to_string(), e))?,
            Err(_) => defaults.union_policy,
        };

        Ok(Self {
            host: std::env::var("LILITH_HOST").unwrap_or(defaults.host),
            port: env_parse("LILITH_PORT", defaults.port)?,
            display: std::env::var("DISPLAY").unwrap_or(defaults.display),
            policy,
            attempt_timeout: Duration::from_millis(env_parse(
                "LILITH_ATTEMPT_TIMEOUT_MS",
                defaults.attempt_timeout.as_millis() as u64,
            )?),
            probe: ProbeConfig {
                retries: env_parse("LILITH_PROBE_RETRIES", defaults.probe.retries)?,
                retry_delay: Duration::from_millis(env_parse(
                    "LILITH_PROBE_RETRY_DELAY_MS",
                    defaults.probe.retry_delay.as_millis() as u64,
                )?),
                timeout: defaults.probe.timeout,
            },
            union_policy,
            static_monitors: std::env::var("LILITH_MONITORS")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            audit_log: std::env::var("LILITH_AUDIT_LOG").ok().map(PathBuf::from),
            audit_capacity: env_parse("LILITH_AUDIT_CAPACITY", defaults.audit_capacity)?,
            policy_file,
        })
    }

    /// Re-read the policy file, if one is configured.
    pub fn reload_policy(&self) -> Result<Option<Policy>, ConfigError> {
        self.policy_file.as_deref().map(load_policy).transpose()
    }
}

/// Read a JSON policy file. Missing fields fall back to their defaults.
pub fn load_policy(path: &Path) -> Result<Policy, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::PolicyFile(path.to_path_buf(), e.to_string()))?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::PolicyFile(path.to_path_buf(), e.to_string()))
}

fn env_var_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_policy_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"permissions": {{"keyboard": false}}, "rate_limits": {{"max_clicks_per_minute": 5}}}}"#
        )
        .unwrap();

        let policy = load_policy(file.path()).unwrap();
        assert!(!policy.permissions.keyboard);
        assert!(policy.permissions.mouse);
        assert_eq!(policy.rate_limits.max_clicks_per_minute, 5);
        assert_eq!(
            policy.rate_limits.max_keystrokes_per_minute,
            RateLimits::default().max_keystrokes_per_minute
        );
    }

    #[test]
    fn test_load_policy_missing_file() {
        let err = load_policy(Path::new("/nonexistent/lilith-policy.json")).unwrap_err();
        assert!(matches!(err, ConfigError::PolicyFile(..)));
    }
}
