//! Configuration for the KAS link core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kas_wire::LinkRole;

use crate::error::ConfigError;

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kas-link")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("link.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Configuration for the connection core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How to spawn the TLS-terminating helper process
    pub helper: HelperConfig,

    /// Inbound backpressure limits
    pub quench: QuenchConfig,

    /// Reconnect backoff policy parameters
    pub backoff: BackoffConfig,

    /// Maximum pump steps per connection per loop iteration.
    ///
    /// Fairness knob for connections sharing the worker; tunable, with no
    /// deeper derivation behind the default.
    pub pump_burst: usize,

    /// Role requested from every server during role selection
    pub local_role: LinkRole,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            helper: HelperConfig::default(),
            quench: QuenchConfig::default(),
            backoff: BackoffConfig::default(),
            pump_burst: 20,
            local_role: LinkRole::Workspace,
        }
    }
}

/// How the tunnel launches its helper process.
///
/// The helper terminates transport security and relays plaintext back to the
/// tunnel's loopback listener. It is invoked as:
/// `<program> <listen host> <listen port> <remote host> <remote port>
/// [-r host:port] [-l level] [-L logpath]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Helper executable
    pub program: PathBuf,

    /// Optional relay to dial through (`-r host:port`)
    pub relay: Option<String>,

    /// Helper log level (`-l`)
    pub log_level: Option<String>,

    /// Helper log file (`-L`)
    pub log_path: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("kas-tunnel-helper"),
            relay: None,
            log_level: None,
            log_path: None,
        }
    }
}

/// Inbound delivery backpressure limits.
///
/// Short bursts pass through untouched; sustained delivery is throttled to
/// one message per `per_message_delay`, and a hard cap on undelivered
/// messages pauses inbound reads entirely until the consumer drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuenchConfig {
    /// Undelivered-message count at which reads pause indefinitely
    pub hard_cap: usize,

    /// Messages allowed per batch window before throttling starts
    pub batch_size: u64,

    /// Pacing delay per delivered message once throttling
    #[serde(with = "duration_millis")]
    pub per_message_delay: Duration,
}

impl Default for QuenchConfig {
    fn default() -> Self {
        Self {
            hard_cap: 50,
            batch_size: 100,
            per_message_delay: Duration::from_millis(5),
        }
    }
}

/// Exponential reconnect backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Multiplier applied per additional consecutive failure
    pub factor: u32,

    /// Exponent cap: delays plateau at `base_delay * factor^max_steps`
    pub max_steps: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            factor: 4,
            max_steps: 5,
        }
    }
}

// Helper module for Duration serialization as whole seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Helper module for Duration serialization as whole milliseconds
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.pump_burst, 20);
        assert_eq!(config.quench.hard_cap, 50);
        assert_eq!(config.quench.batch_size, 100);
        assert_eq!(config.quench.per_message_delay, Duration::from_millis(5));
        assert_eq!(config.backoff.base_delay, Duration::from_secs(60));
        assert_eq!(config.backoff.factor, 4);
        assert_eq!(config.backoff.max_steps, 5);
        assert_eq!(config.local_role, LinkRole::Workspace);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");

        let mut config = LinkConfig::default();
        config.helper.program = PathBuf::from("/opt/kas/helper");
        config.helper.relay = Some("relay.example.com:443".to_string());
        config.backoff.max_steps = 3;

        save_config(&path, &config).unwrap();
        let loaded: LinkConfig = load_config(&path).unwrap();

        assert_eq!(loaded.helper.program, PathBuf::from("/opt/kas/helper"));
        assert_eq!(
            loaded.helper.relay.as_deref(),
            Some("relay.example.com:443")
        );
        assert_eq!(loaded.backoff.max_steps, 3);
        assert_eq!(loaded.pump_burst, 20);
    }

    #[test]
    fn test_missing_file() {
        let result: Result<LinkConfig, _> = load_config(Path::new("/nonexistent/link.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: LinkConfig = toml::from_str("pump_burst = 8").unwrap();
        assert_eq!(parsed.pump_burst, 8);
        assert_eq!(parsed.quench.hard_cap, 50);
    }
}
