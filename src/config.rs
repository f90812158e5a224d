//! Configuration types for the resharding donor service.

use crate::error::{Error, Result};
use backon::ExponentialBuilder;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the donor service.
#[derive(Debug, Clone)]
pub struct DonorServiceConfig {
    /// Maximum number of transition units executing at once across all
    /// donor instances on this node.
    pub max_concurrent_steps: usize,

    /// Retry policy for transient storage failures inside one step.
    pub storage_retry: RetryConfig,

    /// Retry policy for calls through the external state bridge.
    pub external_retry: RetryConfig,

    /// Directory for the durable state snapshot. `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for DonorServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            storage_retry: RetryConfig::storage(),
            external_retry: RetryConfig::external(),
            data_dir: None,
        }
    }
}

impl DonorServiceConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bound on concurrently executing transition units.
    pub fn with_max_concurrent_steps(mut self, n: usize) -> Self {
        self.max_concurrent_steps = n;
        self
    }

    /// Set the storage retry policy.
    pub fn with_storage_retry(mut self, retry: RetryConfig) -> Self {
        self.storage_retry = retry;
        self
    }

    /// Set the external bridge retry policy.
    pub fn with_external_retry(mut self, retry: RetryConfig) -> Self {
        self.external_retry = retry;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_steps == 0 {
            return Err(Error::Config(
                "max_concurrent_steps must be greater than zero".to_string(),
            ));
        }
        self.storage_retry.validate("storage_retry")?;
        self.external_retry.validate("external_retry")?;
        Ok(())
    }
}

/// Exponential backoff settings for one class of retried calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub min_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Retries after the first attempt.
    pub max_retries: usize,

    /// Randomise delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Short delays, few attempts. Local storage conflicts clear quickly or
    /// not at all.
    pub fn storage() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_retries: 5,
            jitter: true,
        }
    }

    /// Longer delays for calls that may wait on a coordinator election.
    pub fn external() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_retries: 10,
            jitter: true,
        }
    }

    /// Near-zero delays, for tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_retries,
            jitter: false,
        }
    }

    /// Build the backoff policy.
    pub fn policy(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.min_delay > self.max_delay {
            return Err(Error::Config(format!(
                "{}: min_delay {:?} exceeds max_delay {:?}",
                name, self.min_delay, self.max_delay
            )));
        }
        Ok(())
    }
}
