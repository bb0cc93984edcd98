//! Runtime configuration.
//!
//! [`WatchConfig`] is the small immutable value read by every classification and aggregation
//! step. It lives inside a [`SharedConfig`], which swaps whole values through a
//! [`tokio::sync::watch`] channel: readers take a snapshot and always see either the old or the
//! new complete value.

use crate::error::{ConfigError, EngineError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Upper bound accepted for the whale threshold (total BTC supply).
pub const MAX_THRESHOLD_BTC: u64 = 21_000_000;

/// Upper bound accepted for the summary interval (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Whale threshold and summary interval in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Minimum transaction value, in BTC, classified as a whale.
    pub threshold: Decimal,
    /// Length of one aggregation window in seconds.
    pub interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            threshold: Decimal::from(100),
            interval_secs: 60,
        }
    }
}

impl WatchConfig {
    /// Construct a validated configuration.
    pub fn new(threshold: Decimal, interval_secs: u64) -> Result<Self, ConfigError> {
        let config = Self {
            threshold,
            interval_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold <= Decimal::ZERO || self.threshold > Decimal::from(MAX_THRESHOLD_BTC) {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if self.interval_secs == 0 || self.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidInterval(self.interval_secs));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Merge a partial update into this configuration, validating the result.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        let next = Self {
            threshold: update.threshold.unwrap_or(self.threshold),
            interval_secs: update.interval_secs.unwrap_or(self.interval_secs),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Partial configuration update. Absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigUpdate {
    pub threshold: Option<Decimal>,
    pub interval_secs: Option<u64>,
}

impl ConfigUpdate {
    pub fn threshold(threshold: Decimal) -> Self {
        Self {
            threshold: Some(threshold),
            interval_secs: None,
        }
    }

    pub fn interval_secs(interval_secs: u64) -> Self {
        Self {
            threshold: None,
            interval_secs: Some(interval_secs),
        }
    }
}

/// Single-writer-many-reader holder of the current [`WatchConfig`].
#[derive(Debug, Clone)]
pub struct SharedConfig {
    tx: Arc<watch::Sender<WatchConfig>>,
}

impl SharedConfig {
    pub fn new(initial: WatchConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        let (tx, _rx) = watch::channel(initial);
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Take a consistent copy of the configuration in effect right now.
    pub fn snapshot(&self) -> WatchConfig {
        *self.tx.borrow()
    }

    /// Apply a partial update and return the effective configuration.
    ///
    /// Concurrent writers are serialised by the channel's write lock, so every update is merged
    /// against the latest value. An invalid update leaves the current value untouched.
    pub fn update(&self, update: ConfigUpdate) -> Result<WatchConfig, ConfigError> {
        let mut outcome = Err(ConfigError::InvalidInterval(0));
        self.tx.send_if_modified(|current| match current.apply(&update) {
            Ok(next) => {
                let changed = next != *current;
                *current = next;
                outcome = Ok(next);
                changed
            }
            Err(error) => {
                outcome = Err(error);
                false
            }
        });
        outcome
    }

    /// Receiver notified whenever the configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<WatchConfig> {
        self.tx.subscribe()
    }
}

/// Engine construction settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Initial whale threshold and summary interval
    pub config: WatchConfig,
    /// Maximum number of queued events per client session
    pub session_capacity: usize,
    /// Number of recent events copied into a new session's queue
    pub replay_size: usize,
    /// Period between fiat rate refreshes
    pub price_refresh: Duration,
    /// How long a draining session may keep consuming queued events
    pub drain_grace: Duration,
    /// First reconnect delay after an upstream failure
    pub reconnect_base: Duration,
    /// Ceiling for the reconnect delay
    pub reconnect_max: Duration,
    /// Upstream silence tolerated before the connection is considered lost
    pub read_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            config: WatchConfig::default(),
            session_capacity: 256,
            replay_size: 16,
            price_refresh: Duration::from_secs(60),
            drain_grace: Duration::from_secs(5),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            read_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineSettings {
    pub fn with_config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_session_capacity(mut self, capacity: usize) -> Self {
        self.session_capacity = capacity;
        self
    }

    pub fn with_replay_size(mut self, size: usize) -> Self {
        self.replay_size = size;
        self
    }

    pub fn with_price_refresh(mut self, period: Duration) -> Self {
        self.price_refresh = period;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.config.validate()?;
        if self.session_capacity == 0 {
            return Err(EngineError::Settings(
                "session capacity must be at least 1".to_string(),
            ));
        }
        if self.price_refresh.is_zero() {
            return Err(EngineError::Settings(
                "price refresh period must be non-zero".to_string(),
            ));
        }
        if self.reconnect_base.is_zero() || self.reconnect_max < self.reconnect_base {
            return Err(EngineError::Settings(format!(
                "reconnect backoff {:?}..{:?} is not a valid range",
                self.reconnect_base, self.reconnect_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_watch_config_validate() {
        struct TestCase {
            threshold: Decimal,
            interval_secs: u64,
            expected: Result<(), ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: defaults
                threshold: dec!(100),
                interval_secs: 60,
                expected: Ok(()),
            },
            TestCase {
                // TC1: zero threshold
                threshold: dec!(0),
                interval_secs: 60,
                expected: Err(ConfigError::InvalidThreshold(dec!(0))),
            },
            TestCase {
                // TC2: negative threshold
                threshold: dec!(-1.5),
                interval_secs: 60,
                expected: Err(ConfigError::InvalidThreshold(dec!(-1.5))),
            },
            TestCase {
                // TC3: threshold above total supply
                threshold: dec!(21000000.1),
                interval_secs: 60,
                expected: Err(ConfigError::InvalidThreshold(dec!(21000000.1))),
            },
            TestCase {
                // TC4: zero interval
                threshold: dec!(0.5),
                interval_secs: 0,
                expected: Err(ConfigError::InvalidInterval(0)),
            },
            TestCase {
                // TC5: interval longer than a day
                threshold: dec!(0.5),
                interval_secs: 86_401,
                expected: Err(ConfigError::InvalidInterval(86_401)),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = WatchConfig {
                threshold: test.threshold,
                interval_secs: test.interval_secs,
            }
            .validate();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_partial_update_keeps_other_field() {
        let config = SharedConfig::new(WatchConfig::default()).unwrap();

        let effective = config.update(ConfigUpdate::threshold(dec!(50))).unwrap();
        assert_eq!(effective.threshold, dec!(50));
        assert_eq!(effective.interval_secs, 60);

        let effective = config.update(ConfigUpdate::interval_secs(30)).unwrap();
        assert_eq!(effective.threshold, dec!(50));
        assert_eq!(effective.interval_secs, 30);
        assert_eq!(config.snapshot(), effective);
    }

    #[test]
    fn test_invalid_update_keeps_previous_config() {
        let config = SharedConfig::new(WatchConfig::default()).unwrap();

        let result = config.update(ConfigUpdate {
            threshold: Some(dec!(25)),
            interval_secs: Some(0),
        });

        assert_eq!(result, Err(ConfigError::InvalidInterval(0)));
        assert_eq!(config.snapshot(), WatchConfig::default());
    }

    #[test]
    fn test_update_notifies_subscribers() {
        let config = SharedConfig::new(WatchConfig::default()).unwrap();
        let mut rx = config.subscribe();
        assert!(!rx.has_changed().unwrap());

        config.update(ConfigUpdate::interval_secs(10)).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().interval_secs, 10);

        // Re-applying the same value is not a change
        config.update(ConfigUpdate::interval_secs(10)).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_concurrent_updates_are_never_torn() {
        // Writers always set threshold == interval, so any reader observing a mismatch has seen
        // half of one update and half of another.
        let config = SharedConfig::new(WatchConfig::new(dec!(1), 1).unwrap()).unwrap();

        std::thread::scope(|scope| {
            for writer in 0..4u64 {
                let config = config.clone();
                scope.spawn(move || {
                    for step in 1..=500u64 {
                        let value = (writer * 500 + step) % MAX_INTERVAL_SECS + 1;
                        config
                            .update(ConfigUpdate {
                                threshold: Some(Decimal::from(value)),
                                interval_secs: Some(value),
                            })
                            .unwrap();
                    }
                });
            }

            for _ in 0..4 {
                let config = config.clone();
                scope.spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = config.snapshot();
                        assert_eq!(snapshot.threshold, Decimal::from(snapshot.interval_secs));
                    }
                });
            }
        });
    }

    #[test]
    fn test_engine_settings_builder() {
        let settings = EngineSettings::default()
            .with_session_capacity(8)
            .with_replay_size(0)
            .with_drain_grace(Duration::from_millis(250))
            .with_reconnect_backoff(Duration::from_millis(100), Duration::from_secs(5));

        assert_eq!(settings.session_capacity, 8);
        assert_eq!(settings.replay_size, 0);
        assert_eq!(settings.drain_grace, Duration::from_millis(250));
        assert_eq!(settings.reconnect_base, Duration::from_millis(100));
        assert_eq!(settings.reconnect_max, Duration::from_secs(5));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_engine_settings_reject_zero_capacity() {
        let settings = EngineSettings::default().with_session_capacity(0);
        assert!(matches!(settings.validate(), Err(EngineError::Settings(_))));
    }
}
