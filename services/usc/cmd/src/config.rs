//! Configuration handling for the USC service.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line. A missing or unreadable file is not an error; every field
//! has a default.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use usc_session::{BackoffConfig, ManagerConfig};
use usc_wire::DEFAULT_MAX_PAYLOAD;

/// USC service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UscConfig {
    /// Port devices call home on
    pub plugin_port: u16,
    /// Default port of the device agent when dialling
    pub agent_port: u16,
    /// Most recent errors kept per device
    pub max_error_number: usize,
    /// Event dispatcher workers
    pub max_thread_number: usize,
    /// Largest accepted payload in bytes
    pub max_payload: usize,
    /// Log error events through the logging listener
    pub log_error_events: bool,
    /// Window for per-device error counts
    #[serde(with = "duration_str")]
    pub error_window: Duration,
    /// Dialling policy
    pub reconnect: ReconnectSettings,
    /// Transport security
    pub security: SecuritySettings,
}

impl Default for UscConfig {
    fn default() -> Self {
        Self {
            plugin_port: 1068,
            agent_port: 1069,
            max_error_number: 100,
            max_thread_number: 4,
            max_payload: DEFAULT_MAX_PAYLOAD,
            log_error_events: true,
            error_window: Duration::from_secs(60),
            reconnect: ReconnectSettings::default(),
            security: SecuritySettings::default(),
        }
    }
}

/// Dialling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Time allowed for one connect attempt, e.g. `10s`
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Delay before the first retry
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    /// Retries after the first attempt; absent retries forever
    pub max_retries: Option<u32>,
    /// Re-dial channels that drop
    pub reconnect_on_drop: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            connect_timeout: backoff.connect_timeout,
            initial_backoff: backoff.initial_backoff,
            max_backoff: backoff.max_backoff,
            max_retries: backoff.max_retries,
            reconnect_on_drop: true,
        }
    }
}

impl ReconnectSettings {
    /// Backoff settings for the reconnection engine
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            connect_timeout: self.connect_timeout,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            max_retries: self.max_retries,
        }
    }
}

/// Transport security
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Use TLS for stream channels
    pub enabled: bool,
    /// Directory relative file names are resolved against
    pub root: PathBuf,
    /// Certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Private key (PEM)
    pub key_file: PathBuf,
    /// CA certificates (PEM)
    pub ca_file: PathBuf,
}

impl SecuritySettings {
    /// Resolve a configured file against `root`
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() || self.root.as_os_str().is_empty() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }
}

impl UscConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<UscConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final configuration: plugin_port={}, agent_port={}, workers={}, security={}",
            config.plugin_port, config.agent_port, config.max_thread_number, config.security.enabled
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("USC_PLUGIN_PORT") {
            self.plugin_port = port;
            info!("Plugin port overridden by environment: {}", port);
        }

        if let Some(port) = env_parse::<u16>("USC_AGENT_PORT") {
            self.agent_port = port;
            info!("Agent port overridden by environment: {}", port);
        }

        if let Some(max) = env_parse::<usize>("USC_MAX_ERROR_NUMBER") {
            self.max_error_number = max;
            info!("Max error number overridden by environment: {}", max);
        }

        if let Some(workers) = env_parse::<usize>("USC_MAX_THREAD_NUMBER") {
            self.max_thread_number = workers;
            info!("Max thread number overridden by environment: {}", workers);
        }

        if let Ok(root) = std::env::var("USC_SECURITY_ROOT") {
            self.security.root = PathBuf::from(root);
            info!("Security root overridden by environment: {:?}", self.security.root);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_thread_number == 0 {
            anyhow::bail!("max_thread_number must be at least 1");
        }
        if self.max_payload == 0 {
            anyhow::bail!("max_payload must be at least 1");
        }
        Ok(())
    }

    /// Channel manager settings
    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            max_payload: self.max_payload,
            backoff: self.reconnect.backoff(),
            reconnect_on_drop: self.reconnect.reconnect_on_drop,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", name, value);
            None
        }
    }
}

/// Durations written the humantime way: `500ms`, `10s`, `1m 30s`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = UscConfig::default();
        assert_eq!(config.plugin_port, 1068);
        assert_eq!(config.agent_port, 1069);
        assert_eq!(config.max_error_number, 100);
        assert_eq!(config.max_thread_number, 4);
        assert!(config.log_error_events);
        assert!(!config.security.enabled);
        assert_eq!(config.reconnect.max_retries, None);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
plugin_port: 4068
max_payload: 65536
log_error_events: false
reconnect:
  connect_timeout: 3s
  initial_backoff: 250ms
  max_backoff: 1m
  max_retries: 5
security:
  enabled: true
  root: /etc/usc
  cert_file: usc.pem
  key_file: /keys/usc.key
  ca_file: ca.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = UscConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.plugin_port, 4068);
        assert_eq!(config.max_payload, 65536);
        assert!(!config.log_error_events);
        assert_eq!(config.max_error_number, 100);

        let backoff = config.reconnect.backoff();
        assert_eq!(backoff.connect_timeout, Duration::from_secs(3));
        assert_eq!(backoff.initial_backoff, Duration::from_millis(250));
        assert_eq!(backoff.max_backoff, Duration::from_secs(60));
        assert_eq!(backoff.max_retries, Some(5));

        let security = &config.security;
        assert!(security.enabled);
        assert_eq!(
            security.resolve(&security.cert_file),
            PathBuf::from("/etc/usc/usc.pem")
        );
        assert_eq!(
            security.resolve(&security.key_file),
            PathBuf::from("/keys/usc.key")
        );
    }

    #[test]
    fn test_missing_and_broken_files_use_defaults() {
        let config = UscConfig::load_from_file("/nonexistent/usc.yaml").unwrap();
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"reconnect: [not, a, map").unwrap();
        let config = UscConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.reconnect, ReconnectSettings::default());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"max_thread_number: 0\n").unwrap();
        assert!(UscConfig::load_from_file(temp_file.path()).is_err());
    }
}
