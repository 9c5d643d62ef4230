//! Registry configuration.
//!
//! Loaded from environment variables with sensible defaults, or embedded in
//! a larger application config through the serde derives. `mode` selects the
//! registry implementation; the remaining fields tune outbox claiming,
//! retry, and dead-lettering.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Which registry implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// In-memory registry: single process, no durability.
    Dev,
    /// Database-backed outbox registry.
    Production,
}

impl fmt::Display for RegistryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for RegistryMode {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "production" => Ok(Self::Production),
            other => {
                Err(RegistryError::Configuration(format!("invalid registry mode: {other}")))
            },
        }
    }
}

/// Tuning knobs for registry construction and outbox processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry implementation selector.
    pub mode: RegistryMode,

    /// Defer outbox processing to the external task queue after commit
    /// instead of processing inline.
    pub async_enabled: bool,

    /// Move exhausted entries to `dead_letter` instead of leaving them
    /// `failed` indefinitely.
    pub dead_letter_enabled: bool,

    /// Maximum rows returned by one `claim_outbox_batch` call.
    pub outbox_batch_size: usize,

    /// Age after which a `claimed` entry is presumed abandoned and becomes
    /// reclaimable.
    pub outbox_claim_ttl_seconds: u64,

    /// Outbox-level retries beyond the first attempt; an entry that keeps
    /// failing performs `max_retries + 1` attempts in total.
    pub max_retries: u32,

    /// Base of the linear backoff gate: `available_at = now + base * attempts`.
    pub retry_backoff_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: RegistryMode::Dev,
            async_enabled: false,
            dead_letter_enabled: true,
            outbox_batch_size: 10,
            outbox_claim_ttl_seconds: 300,
            max_retries: 5,
            retry_backoff_seconds: 30,
        }
    }
}

impl RegistryConfig {
    /// Loads configuration from `HERALD_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            mode: env_parse("HERALD_MODE", defaults.mode)?,
            async_enabled: env_parse("HERALD_ASYNC_ENABLED", defaults.async_enabled)?,
            dead_letter_enabled: env_parse(
                "HERALD_DEAD_LETTER_ENABLED",
                defaults.dead_letter_enabled,
            )?,
            outbox_batch_size: env_parse("HERALD_OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            outbox_claim_ttl_seconds: env_parse(
                "HERALD_OUTBOX_CLAIM_TTL_SECONDS",
                defaults.outbox_claim_ttl_seconds,
            )?,
            max_retries: env_parse("HERALD_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_seconds: env_parse(
                "HERALD_RETRY_BACKOFF_SECONDS",
                defaults.retry_backoff_seconds,
            )?,
        })
    }

    /// Checks that the tuning values are usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero batch size or claim TTL.
    pub fn validate(&self) -> Result<()> {
        if self.outbox_batch_size == 0 {
            return Err(RegistryError::Configuration(
                "outbox_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.outbox_claim_ttl_seconds == 0 {
            return Err(RegistryError::Configuration(
                "outbox_claim_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Claim TTL as a duration.
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.outbox_claim_ttl_seconds)
    }

    /// Linear backoff delay before the next attempt is eligible.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let attempts = u64::try_from(attempts).unwrap_or(0);
        Duration::from_secs(self.retry_backoff_seconds.saturating_mul(attempts))
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| RegistryError::Configuration(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RegistryConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.mode, RegistryMode::Dev);
        assert!(config.dead_letter_enabled);
        assert!(!config.async_enabled);
    }

    #[test]
    fn mode_parses_from_string() {
        assert_eq!("dev".parse::<RegistryMode>().unwrap(), RegistryMode::Dev);
        assert_eq!("production".parse::<RegistryMode>().unwrap(), RegistryMode::Production);
        assert!("staging".parse::<RegistryMode>().is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = RegistryConfig { outbox_batch_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_is_linear_in_attempts() {
        let config = RegistryConfig { retry_backoff_seconds: 30, ..Default::default() };
        assert_eq!(config.backoff_for(0), Duration::from_secs(0));
        assert_eq!(config.backoff_for(1), Duration::from_secs(30));
        assert_eq!(config.backoff_for(4), Duration::from_secs(120));
    }

    #[test]
    fn negative_attempts_clamp_to_zero_backoff() {
        let config = RegistryConfig::default();
        assert_eq!(config.backoff_for(-3), Duration::from_secs(0));
    }

    proptest! {
        #[test]
        fn backoff_never_decreases_with_attempts(
            base in 1u64..3600,
            attempts in 0i32..1000,
        ) {
            let config = RegistryConfig { retry_backoff_seconds: base, ..Default::default() };
            prop_assert!(config.backoff_for(attempts + 1) >= config.backoff_for(attempts));
        }
    }
}
