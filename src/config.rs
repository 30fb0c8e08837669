use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pool configuration.
///
/// All options are fixed at pool construction; there is no dynamic
/// reconfiguration.
///
/// The timeout options use `Option<Duration>` where the zero duration and
/// `None` are meaningful:
///
/// | Option | `None` | `Some(ZERO)` | `Some(d)` |
/// | ------ | ------ | ------------ | --------- |
/// | `poll_timeout` | wait indefinitely | do not wait | wait up to `d` |
/// | `idle_timeout` | never evict | evict on return | evict after `d` idle |
/// | `worker_lifetime` | worker persists | — | worker expires after `d` idle |
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Hard cap on live objects. Must be greater than zero.
    pub max_pool_size: usize,
    /// How long a borrower waits for an idle object once the pool is
    /// saturated. `Some(Duration::ZERO)` makes `borrow` non-blocking: it
    /// returns `Ok(None)` when nothing is immediately available.
    pub poll_timeout: Option<Duration>,
    /// Extra creation attempts after a failed `Manager::create`.
    pub create_retry_count: u32,
    /// Idle interval after which a returned object is evicted by the
    /// background scheduler.
    pub idle_timeout: Option<Duration>,
    /// Run `Manager::validate` on each object popped from the idle deque.
    /// Freshly created objects are not validated.
    pub validate_on_borrow: bool,
    /// Run `Manager::validate` on return; failing objects are silently
    /// removed from the pool.
    pub validate_on_return: bool,
    /// Idle lifetime of the eviction worker task. An expired worker is
    /// respawned the next time an eviction is scheduled.
    pub worker_lifetime: Option<Duration>,
}

impl PoolConfig {
    /// Create a configuration with the given `max_pool_size` and defaults
    /// for everything else.
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            max_pool_size,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_pool_size == 0 {
            return Err("max_pool_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// Default configuration: `max_pool_size` is four times the number of
    /// physical CPU cores, borrowers wait up to 30 seconds, objects are
    /// evicted after 10 minutes idle and no validation is performed.
    fn default() -> Self {
        Self {
            max_pool_size: num_cpus::get_physical() * 4,
            poll_timeout: Some(Duration::from_secs(30)),
            create_retry_count: 0,
            idle_timeout: Some(Duration::from_secs(600)),
            validate_on_borrow: false,
            validate_on_return: false,
            worker_lifetime: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = PoolConfig::default();
        assert!(config.max_pool_size > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = PoolConfig::new(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn new_keeps_defaults_for_other_fields() {
        let config = PoolConfig::new(7);
        assert_eq!(config.max_pool_size, 7);
        assert_eq!(config.create_retry_count, 0);
        assert!(!config.validate_on_borrow);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_from_config_file() {
        let json = r#"
            {
                "max_pool_size": 4,
                "poll_timeout": { "secs": 1, "nanos": 0 },
                "create_retry_count": 2,
                "idle_timeout": null,
                "validate_on_borrow": true,
                "validate_on_return": false,
                "worker_lifetime": null
            }
        "#;
        let config: PoolConfig = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.max_pool_size, 4);
        assert_eq!(config.poll_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.create_retry_count, 2);
        assert_eq!(config.idle_timeout, None);
        assert!(config.validate_on_borrow);
    }
}
