//! # Async Runtime Configuration
//!
//! Configuration keys and the parsed [`AsyncConfig`] the coordinator runs
//! under, plus the transport of the [`PoolRegistry`] through the
//! application configuration.
//!
//! The registry is the only live handle that travels through configuration:
//! the session start-up path stores it under a well-known key prefixed for
//! the driver's consumer configuration, and each processor reads it back in
//! `init`.

use std::sync::Arc;
use std::time::Duration;

use crate::host::AppConfigs;
use crate::pool::PoolRegistry;

/// Number of worker threads per driver thread. `0` disables asynchrony:
/// callbacks run synchronously on the driver with identical semantics.
pub const ASYNC_POOL_SIZE_CONFIG: &str = "keyflow.async.pool.size";

/// Interval of the periodic tick that drains the pipeline while no new
/// records arrive, in milliseconds.
pub const ASYNC_FLUSH_INTERVAL_MS_CONFIG: &str = "keyflow.async.flush.interval.ms";

/// Maximum events a single key may have admitted (offered but not yet
/// done) at once. Must be at least 1.
pub const ASYNC_MAX_EVENTS_PER_KEY_CONFIG: &str = "keyflow.async.max.events.per.key";

/// Key under which the pool registry handle travels through the driver's
/// consumer configuration.
pub const POOL_REGISTRY_CONFIG: &str = "keyflow.internal.async.pool.registry";

/// Prefix scoping configuration entries to the driver's main consumer.
pub const MAIN_CONSUMER_PREFIX: &str = "main.consumer.";

const DEFAULT_POOL_SIZE: usize = 0;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10;
const DEFAULT_MAX_EVENTS_PER_KEY: usize = 3;

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A configuration entry could not be parsed.
    #[error("cannot parse {key}={value}")]
    Parse {
        /// The configuration key.
        key: &'static str,
        /// The unparseable value.
        value: String,
    },

    /// Async processing is enabled but no pool registry was found in the
    /// configuration.
    #[error("no pool registry found under {MAIN_CONSUMER_PREFIX}{POOL_REGISTRY_CONFIG}")]
    MissingRegistry,
}

/// Parsed async runtime configuration for one processor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncConfig {
    /// Worker threads per driver; `0` disables asynchrony.
    pub pool_size: usize,
    /// Periodic drain tick interval.
    pub flush_interval: Duration,
    /// Per-key admission cap; at least 1.
    pub max_events_per_key: usize,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_events_per_key: DEFAULT_MAX_EVENTS_PER_KEY,
        }
    }
}

impl AsyncConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> AsyncConfigBuilder {
        AsyncConfigBuilder::default()
    }

    /// Reads the async configuration entries out of the application
    /// configuration, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for unparseable entries and
    /// [`ConfigError::Invalid`] for values that fail validation.
    pub fn from_app_configs(configs: &AppConfigs) -> Result<Self, ConfigError> {
        let pool_size = parse_entry(configs, ASYNC_POOL_SIZE_CONFIG)?.unwrap_or(DEFAULT_POOL_SIZE);
        let flush_interval_ms = parse_entry(configs, ASYNC_FLUSH_INTERVAL_MS_CONFIG)?
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
        let max_events_per_key = parse_entry(configs, ASYNC_MAX_EVENTS_PER_KEY_CONFIG)?
            .unwrap_or(DEFAULT_MAX_EVENTS_PER_KEY);

        let config = Self {
            pool_size,
            flush_interval: Duration::from_millis(flush_interval_ms),
            max_events_per_key,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events_per_key == 0 {
            return Err(ConfigError::Invalid(
                "max_events_per_key must be at least 1".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// True iff callbacks run on the worker pool rather than inline.
    #[must_use]
    pub fn async_enabled(&self) -> bool {
        self.pool_size > 0
    }
}

fn parse_entry<T: std::str::FromStr>(
    configs: &AppConfigs,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    configs
        .get(key)
        .map(|raw| {
            raw.parse().map_err(|_| ConfigError::Parse {
                key,
                value: raw.to_string(),
            })
        })
        .transpose()
}

/// Builder for [`AsyncConfig`].
#[derive(Debug, Default)]
pub struct AsyncConfigBuilder {
    pool_size: Option<usize>,
    flush_interval: Option<Duration>,
    max_events_per_key: Option<usize>,
}

impl AsyncConfigBuilder {
    /// Sets the worker count per driver.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the periodic drain tick interval.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Sets the per-key admission cap.
    #[must_use]
    pub fn max_events_per_key(mut self, cap: usize) -> Self {
        self.max_events_per_key = Some(cap);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn build(self) -> Result<AsyncConfig, ConfigError> {
        let config = AsyncConfig {
            pool_size: self.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            flush_interval: self
                .flush_interval
                .unwrap_or(Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)),
            max_events_per_key: self.max_events_per_key.unwrap_or(DEFAULT_MAX_EVENTS_PER_KEY),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Writes the async configuration entries into an application
/// configuration, alongside whatever the host already carries.
pub fn store_async_config(configs: &mut AppConfigs, config: &AsyncConfig) {
    configs.set(ASYNC_POOL_SIZE_CONFIG, config.pool_size.to_string());
    configs.set(
        ASYNC_FLUSH_INTERVAL_MS_CONFIG,
        config.flush_interval.as_millis().to_string(),
    );
    configs.set(
        ASYNC_MAX_EVENTS_PER_KEY_CONFIG,
        config.max_events_per_key.to_string(),
    );
}

/// Stores the pool registry under its well-known consumer-prefixed key.
pub fn store_pool_registry(configs: &mut AppConfigs, registry: Arc<PoolRegistry>) {
    configs.set_handle(
        format!("{MAIN_CONSUMER_PREFIX}{POOL_REGISTRY_CONFIG}"),
        registry,
    );
}

/// Reads the pool registry back out of the configuration.
///
/// # Errors
///
/// Returns [`ConfigError::MissingRegistry`] if the handle is absent.
pub fn load_pool_registry(configs: &AppConfigs) -> Result<Arc<PoolRegistry>, ConfigError> {
    configs
        .with_prefix(MAIN_CONSUMER_PREFIX)
        .handle::<PoolRegistry>(POOL_REGISTRY_CONFIG)
        .ok_or(ConfigError::MissingRegistry)
}
