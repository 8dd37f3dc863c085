//! Hub configuration.
//!
//! Mirrors [`crate::message_router::config::RouterConfig`]'s
//! builder-plus-validation shape: a struct of `nutype`-validated fields, a
//! fluent builder, named presets, and JSON file round-tripping.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

/// Errors raised while building or loading a [`HubConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field or cross-field check failed validation.
    #[error("invalid configuration for `{field}`: {reason}")]
    ValidationError {
        /// The field (or relationship between fields) that failed.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Reading or writing the config file failed.
    #[error("config file I/O failed: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },

    /// The config file's contents were not valid JSON.
    #[error("config file is not valid JSON: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },
}

/// TCP port the push server listens on.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 3003
)]
pub struct PushPort(u16);

/// Per-attempt delivery deadline, in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 5000
)]
pub struct DeliveryTimeoutMs(u64);

/// Time after `delivered` to wait for an ack before `timeout`, in
/// milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 10_000
)]
pub struct AckTimeoutMs(u64);

/// Delivery attempt ceiling.
#[nutype(
    validate(greater = 0, less_or_equal = 20),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 3
)]
pub struct MaxRetries(u32);

/// Exponential backoff base, in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 1000
)]
pub struct BaseBackoffMs(u64);

/// Session dead threshold, in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 60_000
)]
pub struct HeartbeatTimeoutMs(u64);

/// Sweeper cleanup cadence, in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 60_000
)]
pub struct SweeperIntervalMs(u64);

/// Absolute max age of a tracked message, in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default),
    default = 300_000
)]
pub struct EvictionAgeMs(u64);

impl DeliveryTimeoutMs {
    /// This deadline as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

impl AckTimeoutMs {
    /// This deadline as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

impl BaseBackoffMs {
    /// This base as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

impl HeartbeatTimeoutMs {
    /// This threshold as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

impl SweeperIntervalMs {
    /// This cadence as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

impl EvictionAgeMs {
    /// This age bound as a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Hub configuration, with defaults matching the specification's
/// configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Port the push server listens on.
    pub push_port: PushPort,
    /// Per-attempt delivery deadline.
    pub delivery_timeout_ms: DeliveryTimeoutMs,
    /// Ack wait time before `timeout`.
    pub ack_timeout_ms: AckTimeoutMs,
    /// Delivery attempt ceiling.
    pub max_retries: MaxRetries,
    /// Exponential backoff base.
    pub base_backoff_ms: BaseBackoffMs,
    /// Session dead threshold.
    pub heartbeat_timeout_ms: HeartbeatTimeoutMs,
    /// Cleanup cadence.
    pub sweeper_interval_ms: SweeperIntervalMs,
    /// Absolute max age of a tracked message.
    pub eviction_age_ms: EvictionAgeMs,
    /// Enables the full guaranteed-delivery state machine. When `false`,
    /// sends behave as best-effort delivery without tracking (the
    /// consolidated "legacy" path described in the design notes: the
    /// special case `requiresAck=false, requiresReadReceipt=false`).
    pub enhanced: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            push_port: PushPort::default(),
            delivery_timeout_ms: DeliveryTimeoutMs::default(),
            ack_timeout_ms: AckTimeoutMs::default(),
            max_retries: MaxRetries::default(),
            base_backoff_ms: BaseBackoffMs::default(),
            heartbeat_timeout_ms: HeartbeatTimeoutMs::default(),
            sweeper_interval_ms: SweeperIntervalMs::default(),
            eviction_age_ms: EvictionAgeMs::default(),
            enhanced: true,
        }
    }
}

impl HubConfig {
    /// Starts a fluent builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }

    /// Validates cross-field invariants not expressible on a single
    /// `nutype` field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the ack timeout is not
    /// comfortably larger than the worst-case retry schedule, or if the
    /// eviction age is not larger than the ack timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let worst_case_retry_ms: u64 = (0..self.max_retries.into_inner())
            .map(|attempt| self.base_backoff_ms.into_inner() * 2u64.saturating_pow(attempt))
            .sum();

        if self.ack_timeout_ms.into_inner() < self.delivery_timeout_ms.into_inner() {
            return Err(ConfigError::ValidationError {
                field: "ack_timeout_ms".to_string(),
                reason: "must be >= delivery_timeout_ms".to_string(),
            });
        }

        if self.eviction_age_ms.into_inner()
            <= self.ack_timeout_ms.into_inner() + worst_case_retry_ms
        {
            return Err(ConfigError::ValidationError {
                field: "eviction_age_ms".to_string(),
                reason: "must exceed ack_timeout_ms plus the worst-case retry schedule"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not contain
    /// valid configuration JSON.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves this configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Fluent builder for [`HubConfig`].
///
/// Setters take the already-validated `nutype` newtype rather than a raw
/// primitive, so a caller runs `try_new` (and handles its `Err`) at the call
/// site; the builder never has an invalid value to silently paper over.
#[derive(Debug, Clone, Default)]
pub struct HubConfigBuilder {
    config: HubConfig,
}

impl HubConfigBuilder {
    /// Sets the push server's listening port.
    #[must_use]
    pub fn push_port(mut self, port: PushPort) -> Self {
        self.config.push_port = port;
        self
    }

    /// Sets the per-attempt delivery deadline.
    #[must_use]
    pub fn delivery_timeout_ms(mut self, ms: DeliveryTimeoutMs) -> Self {
        self.config.delivery_timeout_ms = ms;
        self
    }

    /// Sets the ack wait time.
    #[must_use]
    pub fn ack_timeout_ms(mut self, ms: AckTimeoutMs) -> Self {
        self.config.ack_timeout_ms = ms;
        self
    }

    /// Sets the delivery attempt ceiling.
    #[must_use]
    pub fn max_retries(mut self, retries: MaxRetries) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Sets the exponential backoff base.
    #[must_use]
    pub fn base_backoff_ms(mut self, ms: BaseBackoffMs) -> Self {
        self.config.base_backoff_ms = ms;
        self
    }

    /// Sets the session dead threshold.
    #[must_use]
    pub fn heartbeat_timeout_ms(mut self, ms: HeartbeatTimeoutMs) -> Self {
        self.config.heartbeat_timeout_ms = ms;
        self
    }

    /// Sets the sweeper cadence.
    #[must_use]
    pub fn sweeper_interval_ms(mut self, ms: SweeperIntervalMs) -> Self {
        self.config.sweeper_interval_ms = ms;
        self
    }

    /// Sets the absolute max age of a tracked message.
    #[must_use]
    pub fn eviction_age_ms(mut self, ms: EvictionAgeMs) -> Self {
        self.config.eviction_age_ms = ms;
        self
    }

    /// Enables or disables the full guaranteed-delivery state machine.
    #[must_use]
    pub fn enhanced(mut self, enhanced: bool) -> Self {
        self.config.enhanced = enhanced;
        self
    }

    /// Validates and finalizes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the assembled
    /// configuration fails cross-field validation.
    pub fn build(self) -> Result<HubConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HubConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_produces_requested_values() {
        let config = HubConfig::builder()
            .push_port(PushPort::try_new(4000).expect("valid"))
            .max_retries(MaxRetries::try_new(5).expect("valid"))
            .base_backoff_ms(BaseBackoffMs::try_new(500).expect("valid"))
            .ack_timeout_ms(AckTimeoutMs::try_new(20_000).expect("valid"))
            .eviction_age_ms(EvictionAgeMs::try_new(400_000).expect("valid"))
            .build()
            .expect("valid configuration");

        assert_eq!(config.push_port.into_inner(), 4000);
        assert_eq!(config.max_retries.into_inner(), 5);
    }

    #[test]
    fn ack_timeout_below_delivery_timeout_is_rejected() {
        let result = HubConfig::builder()
            .delivery_timeout_ms(DeliveryTimeoutMs::try_new(10_000).expect("valid"))
            .ack_timeout_ms(AckTimeoutMs::try_new(5_000).expect("valid"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn eviction_age_too_small_for_retry_schedule_is_rejected() {
        let result = HubConfig::builder()
            .max_retries(MaxRetries::try_new(5).expect("valid"))
            .base_backoff_ms(BaseBackoffMs::try_new(10_000).expect("valid"))
            .eviction_age_ms(EvictionAgeMs::try_new(50_000).expect("valid"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn max_retries_above_twenty_is_rejected_at_the_call_site() {
        assert!(MaxRetries::try_new(25).is_err());
    }

    #[test]
    fn round_trips_through_a_file() {
        let config = HubConfig::default();
        let file = tempfile::NamedTempFile::new().expect("temp file");
        config.save_to_file(file.path()).expect("save");
        let loaded = HubConfig::load_from_file(file.path()).expect("load");
        assert_eq!(loaded.push_port.into_inner(), config.push_port.into_inner());
        assert_eq!(loaded.max_retries.into_inner(), config.max_retries.into_inner());
    }

    #[test]
    fn serializes_and_deserializes_as_json() {
        let config = HubConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let roundtripped: HubConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(roundtripped.push_port.into_inner(), config.push_port.into_inner());
    }
}
