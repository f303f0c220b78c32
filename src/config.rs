//! Transport configuration
//!
//! Small TOML-loadable knob set for the transport core: the token renewal
//! policy and the receiver prefetch hint. Every field has a default, so an
//! empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Token renewal policy.
///
/// A token with lifetime `L` is renewed after `renewal_fraction × L`,
/// capped so that at least one retry interval remains before expiry. With
/// the default fraction of 0.8, a one-hour token is renewed after 48
/// minutes, leaving a 12-minute window to retry transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenPolicy {
    /// Fraction of the token lifetime after which renewal fires.
    /// Must be strictly between 0 and 1.
    #[serde(default = "default_renewal_fraction")]
    pub renewal_fraction: f64,
    /// Seconds between renewal retries after a transient failure.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_renewal_fraction() -> f64 {
    0.8
}

fn default_retry_interval_secs() -> u64 {
    10
}

fn default_prefetch_count() -> u32 {
    50
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            renewal_fraction: default_renewal_fraction(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl TokenPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Delay before the next renewal for a token with the given remaining
    /// lifetime. The delay never reaches past `lifetime - retry_interval`,
    /// so a renewal that fails still has a full retry interval before the
    /// token expires; an almost-spent lifetime renews immediately.
    pub fn renewal_delay(&self, lifetime: Duration) -> Duration {
        // Hand-built policies can carry out-of-range fractions; clamp.
        let fraction = if self.renewal_fraction.is_finite() {
            self.renewal_fraction.clamp(0.0, 1.0)
        } else {
            default_renewal_fraction()
        };
        let scaled = lifetime.mul_f64(fraction);
        let cap = lifetime.saturating_sub(self.retry_interval());
        scaled.min(cap)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.renewal_fraction > 0.0 && self.renewal_fraction < 1.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "renewal_fraction must be in (0, 1), got {}",
                self.renewal_fraction
            )));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport core configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Token renewal policy.
    #[serde(default)]
    pub token: TokenPolicy,
    /// Receiver credit hint the device layer copies into receiving-link
    /// settings.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            token: TokenPolicy::default(),
            prefetch_count: default_prefetch_count(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: TransportConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token.validate()?;
        if self.prefetch_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "prefetch_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: TransportConfig = toml::from_str("").unwrap();

        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.token.renewal_fraction, 0.8);
        assert_eq!(config.token.retry_interval_secs, 10);
        assert_eq!(config.prefetch_count, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_toml_parses() {
        let toml_content = r#"
prefetch_count = 10

[token]
renewal_fraction = 0.5
retry_interval_secs = 5
"#;

        let config: TransportConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.token.renewal_fraction, 0.5);
        assert_eq!(config.token.retry_interval_secs, 5);
        assert_eq!(config.prefetch_count, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_fraction() {
        for fraction in [0.0, 1.0, 1.5, -0.2] {
            let policy = TokenPolicy {
                renewal_fraction: fraction,
                retry_interval_secs: 10,
            };
            assert!(policy.validate().is_err(), "fraction {fraction} accepted");
        }
    }

    #[test]
    fn test_validate_rejects_zero_retry_interval() {
        let policy = TokenPolicy {
            renewal_fraction: 0.8,
            retry_interval_secs: 0,
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_prefetch() {
        let config = TransportConfig {
            prefetch_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renewal_delay_for_hour_long_token() {
        // One-hour token, default policy: renew after 48 minutes
        let policy = TokenPolicy::default();
        let delay = policy.renewal_delay(Duration::from_secs(3600));
        assert_eq!(delay, Duration::from_secs(2880));
    }

    #[test]
    fn test_renewal_delay_capped_by_retry_margin() {
        let policy = TokenPolicy {
            renewal_fraction: 0.9,
            retry_interval_secs: 30,
        };
        // Scaled point would be 54s, but the cap keeps a 30s margin
        let delay = policy.renewal_delay(Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_renewal_delay_for_nearly_spent_lifetime() {
        let policy = TokenPolicy::default();
        // Lifetime shorter than the retry interval: renew immediately
        let delay = policy.renewal_delay(Duration::from_secs(5));
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.toml");
        std::fs::write(
            &path,
            "prefetch_count = 25\n\n[token]\nrenewal_fraction = 0.75\nretry_interval_secs = 15\n",
        )
        .unwrap();

        let config = TransportConfig::load_from_file(&path).unwrap();
        assert_eq!(config.prefetch_count, 25);
        assert_eq!(config.token.renewal_fraction, 0.75);
        assert_eq!(config.token.retry_interval_secs, 15);
    }

    #[test]
    fn test_load_from_file_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.toml");
        std::fs::write(&path, "[token]\nrenewal_fraction = 2.0\n").unwrap();

        let result = TransportConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = TransportConfig::load_from_file(Path::new("/nonexistent/transport.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    proptest! {
        #[test]
        fn prop_renewal_always_leaves_retry_margin(
            lifetime_secs in 0u64..200_000,
            fraction in 0.01f64..0.99,
            retry_secs in 1u64..300,
        ) {
            let policy = TokenPolicy {
                renewal_fraction: fraction,
                retry_interval_secs: retry_secs,
            };
            let lifetime = Duration::from_secs(lifetime_secs);

            let delay = policy.renewal_delay(lifetime);

            // Renewal never lands inside the final retry interval
            prop_assert!(delay <= lifetime.saturating_sub(policy.retry_interval()));
            // And never past the scaled renewal point
            prop_assert!(delay.as_secs_f64() <= lifetime.as_secs_f64() * fraction + 1e-6);
        }
    }
}
