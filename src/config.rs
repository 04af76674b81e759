//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix for environment overrides, e.g. `TURNSTILE_THROTTLE__LIMIT=10`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Interval pacing for the default route
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Global fixed-window throttle
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Per-client fixed-window limits
    #[serde(default)]
    pub per_client: PerClientConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// How long a paced request may wait for its turn, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_request_timeout() -> u64 {
    5000
}

/// Interval pacing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Time between grants in milliseconds
    #[serde(default = "default_pacing_interval")]
    pub interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_pacing_interval(),
        }
    }
}

fn default_pacing_interval() -> u64 {
    2000
}

/// Global throttle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum requests per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window(),
        }
    }
}

/// Per-client limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerClientConfig {
    /// Maximum requests per window for each client
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Evict a client's counter after this many idle seconds
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// How often to look for idle counters, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PerClientConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_limit() -> u64 {
    5
}

fn default_window() -> u64 {
    1000
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PacingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl PerClientConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    ///
    /// The file format follows its extension (YAML, TOML or JSON).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                TurnstileError::Config(format!("Failed to parse configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Reject settings no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.pacing.interval_ms, "pacing.interval_ms"),
            (self.throttle.limit, "throttle.limit"),
            (self.throttle.window_ms, "throttle.window_ms"),
            (self.per_client.limit, "per_client.limit"),
            (self.per_client.window_ms, "per_client.window_ms"),
            (self.per_client.idle_ttl_secs, "per_client.idle_ttl_secs"),
            (self.per_client.sweep_interval_secs, "per_client.sweep_interval_secs"),
        ];

        for (value, name) in checks {
            if value == 0 {
                return Err(TurnstileError::Config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.pacing.interval(), Duration::from_secs(2));
        assert_eq!(config.throttle.limit, 5);
        assert_eq!(config.throttle.window(), Duration::from_secs(1));
        assert_eq!(config.per_client.idle_ttl(), Duration::from_secs(300));
        assert_eq!(config.per_client.sweep_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
throttle:
  limit: 20
per_client:
  idle_ttl_secs: 30
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.throttle.limit, 20);
        assert_eq!(config.throttle.window_ms, 1000);
        assert_eq!(config.per_client.idle_ttl_secs, 30);
        assert_eq!(config.per_client.limit, 5);
        assert_eq!(config.pacing, PacingConfig::default());
    }

    #[test]
    fn test_zero_values_rejected() {
        let yaml = r#"
pacing:
  interval_ms: 0
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("pacing.interval_ms"));

        let mut config = TurnstileConfig::default();
        config.per_client.sweep_interval_secs = 0;
        assert!(matches!(config.validate(), Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_yaml_round_trip_preserves_values() {
        let mut config = TurnstileConfig::default();
        config.per_client.limit = 42;

        let yaml = config.to_yaml().unwrap();
        assert_eq!(TurnstileConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.pacing.interval_ms, 2000);
    }

    // Each test below owns its variable so parallel loads never disagree.
    #[test]
    fn test_load_applies_env_override() {
        std::env::set_var("TURNSTILE_THROTTLE__LIMIT", "17");
        let config = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE_THROTTLE__LIMIT");

        let config = config.unwrap();
        assert_eq!(config.throttle.limit, 17);
        assert_eq!(config.throttle.window_ms, 1000);
    }

    #[test]
    fn test_load_file_then_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "per_client:\n  limit: 9\n  window_ms: 400\nserver:\n  listen_addr: \"0.0.0.0:9000\""
        )
        .unwrap();

        std::env::set_var("TURNSTILE_PER_CLIENT__WINDOW_MS", "250");
        let config = TurnstileConfig::load(Some(file.path()));
        std::env::remove_var("TURNSTILE_PER_CLIENT__WINDOW_MS");

        let config = config.unwrap();
        assert_eq!(config.per_client.limit, 9);
        assert_eq!(config.per_client.window_ms, 250);
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TurnstileConfig::load(Some(Path::new("/nonexistent/turnstile.yaml")));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
