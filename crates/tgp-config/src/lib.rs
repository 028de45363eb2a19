//! Process-level configuration for the GPU fleet operator.
//!
//! Loaded once at startup from a mounted YAML file, with per-field
//! environment-variable overrides. Mirrors the shape (and the
//! `from_mounted_file` / `validate` / `Default` trio) of the teacher's own
//! controller configuration, simplified to this operator's much smaller
//! surface.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pointer to a Kubernetes Secret holding a provider's API credentials.
/// The core reads it once at startup and never logs the value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub credentials_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    #[serde(default = "default_pricing_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            ttl: default_pricing_ttl(),
        }
    }
}

fn default_pricing_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsConfig {
    #[serde(default = "default_max_lifetime", with = "humantime_serde")]
    pub max_lifetime: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_lifetime: default_max_lifetime(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_max_lifetime() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Top-level operator configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl OperatorConfig {
    /// Loads configuration from `path`, falling back to environment-variable
    /// overrides for the providers' credential secret names when set as
    /// `TGP_PROVIDER_<NAME>_SECRET`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Resolves the config path from `CONFIG_PATH`, defaulting to
    /// `/config/config.yaml`; falls back to [`OperatorConfig::default`] with
    /// a warning when the file is missing, matching the teacher's
    /// load-or-default startup pattern.
    #[must_use]
    pub fn load_or_default() -> Self {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/config/config.yaml".to_string());
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load operator config, using defaults");
                Self::default()
            }
        }
    }

    /// Rejects configs with zero enabled providers or non-positive
    /// durations.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.values().any(|p| p.enabled) {
            return Err(ConfigError::Invalid(
                "at least one provider must be enabled".to_string(),
            ));
        }
        if self.pricing.ttl.is_zero() {
            return Err(ConfigError::Invalid("pricing.ttl must be > 0".to_string()));
        }
        if self.reconcile.max_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "reconcile.max_backoff must be > 0".to_string(),
            ));
        }
        if self.defaults.max_lifetime.is_zero() {
            return Err(ConfigError::Invalid(
                "defaults.max_lifetime must be > 0".to_string(),
            ));
        }
        if self.defaults.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "defaults.idle_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_with_no_providers() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_passes_with_one_enabled_provider() {
        let mut config = OperatorConfig::default();
        config.providers.insert(
            "runpod".to_string(),
            ProviderConfig {
                enabled: true,
                credentials_ref: None,
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_yaml_with_duration_strings() {
        let yaml = r#"
providers:
  runpod:
    enabled: true
    credentialsRef:
      name: runpod-credentials
      key: apiKey
pricing:
  ttl: 15m
reconcile:
  maxBackoff: 5m
defaults:
  maxLifetime: 1h
  idleTimeout: 30m
"#;
        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pricing.ttl, Duration::from_secs(15 * 60));
        assert_eq!(config.defaults.max_lifetime, Duration::from_secs(3600));
    }
}
