use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;

use courier_fetch::HttpSettings;

/// Contents of `~/.courier/config.toml`. Every section is optional.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CourierConfig {
    pub storage: Option<StorageConfig>,
    pub queue: Option<QueueConfig>,
    pub fetch: Option<FetchConfig>,
    pub executor: Option<ExecutorConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-actor SQLite files. Supports `~` and `${VAR}`.
    pub data_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueueConfig {
    /// Entries moved to in-flight per processing pass.
    pub batch_size: Option<usize>,
    /// Delay of the follow-up pass scheduled after a full batch.
    pub follow_up_delay_ms: Option<u64>,
    /// In-flight entries older than this are dropped on recovery.
    pub max_in_flight_age_secs: Option<u64>,
    /// Down-jitter factor applied to retry backoff, clamped to `[0, 1]`.
    pub retry_jitter: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FetchConfig {
    pub user_agent: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub max_body_bytes: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Perform raced calls but never report back, leaving every race to its wake-up.
    #[serde(default)]
    pub suppress_delivery: bool,
}

impl CourierConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_FOLLOW_UP_DELAY_MS: u64 = 0;
    pub const DEFAULT_MAX_IN_FLIGHT_AGE_SECS: u64 = 600;
    pub const DEFAULT_RETRY_JITTER: f64 = 0.25;

    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Configured storage root, or `~/.courier/actors`.
    #[must_use]
    pub fn data_dir(&self) -> Option<PathBuf> {
        match self.storage.as_ref().and_then(|s| s.data_dir.as_deref()) {
            Some(raw) => Some(expand_path(raw)),
            None => dirs::home_dir().map(|home| home.join(".courier").join("actors")),
        }
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.queue
            .as_ref()
            .and_then(|q| q.batch_size)
            .unwrap_or(Self::DEFAULT_BATCH_SIZE)
            .max(1)
    }

    #[must_use]
    pub fn follow_up_delay(&self) -> Duration {
        Duration::from_millis(
            self.queue
                .as_ref()
                .and_then(|q| q.follow_up_delay_ms)
                .unwrap_or(Self::DEFAULT_FOLLOW_UP_DELAY_MS),
        )
    }

    #[must_use]
    pub fn max_in_flight_age(&self) -> Duration {
        Duration::from_secs(
            self.queue
                .as_ref()
                .and_then(|q| q.max_in_flight_age_secs)
                .unwrap_or(Self::DEFAULT_MAX_IN_FLIGHT_AGE_SECS),
        )
    }

    #[must_use]
    pub fn retry_jitter(&self) -> f64 {
        let jitter = self
            .queue
            .as_ref()
            .and_then(|q| q.retry_jitter)
            .unwrap_or(Self::DEFAULT_RETRY_JITTER);
        if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            Self::DEFAULT_RETRY_JITTER
        }
    }

    #[must_use]
    pub fn http_settings(&self) -> HttpSettings {
        let mut settings = HttpSettings::default();
        if let Some(fetch) = &self.fetch {
            if let Some(agent) = &fetch.user_agent {
                settings.user_agent.clone_from(agent);
            }
            if let Some(ms) = fetch.connect_timeout_ms {
                settings.connect_timeout = Duration::from_millis(ms);
            }
            if let Some(bytes) = fetch.max_body_bytes {
                settings.max_body_bytes = bytes;
            }
        }
        settings
    }

    #[must_use]
    pub fn suppress_delivery(&self) -> bool {
        self.executor.as_ref().is_some_and(|e| e.suppress_delivery)
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".courier").join("config.toml"))
}

/// Expand `${VAR}` references and a leading `~/`.
fn expand_path(raw: &str) -> PathBuf {
    let expanded = expand_env_vars(raw);
    if let Some(rest) = expanded.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if expanded == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(expanded)
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: CourierConfig = toml::from_str("").unwrap();
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.follow_up_delay(), Duration::ZERO);
        assert_eq!(config.max_in_flight_age(), Duration::from_secs(600));
        assert!((config.retry_jitter() - 0.25).abs() < f64::EPSILON);
        assert!(!config.suppress_delivery());
        assert_eq!(
            config.http_settings().user_agent,
            HttpSettings::DEFAULT_USER_AGENT
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config: CourierConfig = toml::from_str(
            r#"
            [storage]
            data_dir = "/var/lib/courier"

            [queue]
            batch_size = 0
            follow_up_delay_ms = 250
            max_in_flight_age_secs = 30
            retry_jitter = 4.0

            [fetch]
            user_agent = "courier-test/1"
            connect_timeout_ms = 1500

            [executor]
            suppress_delivery = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir(), Some(PathBuf::from("/var/lib/courier")));
        assert_eq!(config.batch_size(), 1, "batch size is at least one");
        assert_eq!(config.follow_up_delay(), Duration::from_millis(250));
        assert_eq!(config.max_in_flight_age(), Duration::from_secs(30));
        assert!((config.retry_jitter() - 1.0).abs() < f64::EPSILON);
        assert!(config.suppress_delivery());

        let http = config.http_settings();
        assert_eq!(http.user_agent, "courier-test/1");
        assert_eq!(http.connect_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue\nbatch_size = ").unwrap();

        let err = CourierConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &path);
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = CourierConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn expand_env_vars_handles_unclosed_and_empty() {
        assert_eq!(expand_env_vars("plain"), "plain");
        assert_eq!(expand_env_vars("a ${} b"), "a  b");
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
        assert_eq!(
            expand_env_vars("x${COURIER_SURELY_UNSET_VAR_123}y"),
            "xy"
        );
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/data"), home.join("data"));
        }
    }
}
