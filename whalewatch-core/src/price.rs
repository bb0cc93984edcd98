//! Fiat conversion rate.
//!
//! The [`PriceOracle`] serves the last successfully fetched rate and never blocks or fails a
//! reader: a failed refresh keeps the previous rate and is retried on the next scheduled tick.

use crate::error::PriceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Default CoinGecko BTC/USD endpoint.
pub const DEFAULT_COINGECKO_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd";

/// Pull-based source of the BTC fiat rate.
#[async_trait]
pub trait RateSource: Send + Sync + 'static {
    async fn fetch_rate(&self) -> Result<Decimal, PriceError>;
}

/// CoinGecko `simple/price` REST client.
#[derive(Debug, Clone)]
pub struct CoinGeckoRateSource {
    client: Client,
    url: Url,
}

/// CoinGecko REST API response for `simple/price?ids=bitcoin&vs_currencies=usd`
#[derive(Debug, Deserialize)]
struct CoinGeckoPriceResponse {
    bitcoin: Option<CoinGeckoQuote>,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoQuote {
    usd: Option<Decimal>,
}

impl CoinGeckoRateSource {
    /// Build a client for `url`, which must be an absolute `http` or `https` URL.
    pub fn new(url: &str) -> Result<Self, PriceError> {
        let url = Url::parse(url).map_err(|error| PriceError::Url(format!("{url}: {error}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PriceError::Url(format!("unsupported scheme {}", url.scheme())));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(PriceError::from)?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RateSource for CoinGeckoRateSource {
    async fn fetch_rate(&self) -> Result<Decimal, PriceError> {
        let response = self.client.get(self.url.clone()).send().await?;
        if let Err(status_err) = response.error_for_status_ref() {
            return Err(PriceError::from(status_err));
        }

        let body = response.json::<CoinGeckoPriceResponse>().await?;
        let rate = body
            .bitcoin
            .and_then(|quote| quote.usd)
            .ok_or_else(|| PriceError::Parse("missing bitcoin.usd field".to_string()))?;

        if rate <= Decimal::ZERO {
            return Err(PriceError::InvalidRate(rate));
        }
        Ok(rate)
    }
}

/// Point-in-time view of the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    /// Last successfully fetched rate, zero before the first success.
    pub rate: Decimal,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Whether the most recent refresh attempt failed.
    pub stale: bool,
}

#[derive(Debug)]
pub struct PriceOracle {
    source: Arc<dyn RateSource>,
    refresh_period: Duration,
    state: RwLock<RateSnapshot>,
}

impl PriceOracle {
    pub fn new(source: Arc<dyn RateSource>, refresh_period: Duration) -> Self {
        Self {
            source,
            refresh_period,
            state: RwLock::new(RateSnapshot {
                rate: Decimal::ZERO,
                fetched_at: None,
                stale: true,
            }),
        }
    }

    /// Most recently fetched rate. Never blocks on the price service.
    pub fn current_rate(&self) -> Decimal {
        self.state.read().rate
    }

    pub fn snapshot(&self) -> RateSnapshot {
        *self.state.read()
    }

    /// Fetch once and update the cached rate. A failure only marks the cached rate as stale.
    pub async fn refresh(&self) -> Result<Decimal, PriceError> {
        match self.source.fetch_rate().await {
            Ok(rate) => {
                *self.state.write() = RateSnapshot {
                    rate,
                    fetched_at: Some(Utc::now()),
                    stale: false,
                };
                debug!(%rate, "refreshed fiat rate");
                Ok(rate)
            }
            Err(error) => {
                let mut state = self.state.write();
                state.stale = true;
                warn!(
                    %error,
                    retained = %state.rate,
                    "fiat rate refresh failed, keeping previous rate"
                );
                Err(error)
            }
        }
    }

    /// Refresh on a fixed timer until cancelled. The first refresh happens immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.refresh_period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period = ?self.refresh_period, "starting fiat rate refresh");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                // Failures are already logged, retry waits for the next tick
                _ = self.refresh() => {}
            }
        }

        debug!("fiat rate refresh stopped");
    }
}

impl std::fmt::Debug for dyn RateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RateSource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Default)]
    struct ScriptedRates {
        responses: Mutex<VecDeque<Result<Decimal, PriceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRates {
        fn new(responses: impl IntoIterator<Item = Result<Decimal, PriceError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RateSource for ScriptedRates {
        async fn fetch_rate(&self) -> Result<Decimal, PriceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(PriceError::Http("no more responses".to_string())))
        }
    }

    #[test]
    fn test_coingecko_source_url_validation() {
        struct TestCase {
            input: &'static str,
            valid: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: default endpoint
                input: DEFAULT_COINGECKO_URL,
                valid: true,
            },
            TestCase {
                // TC1: plain http mirror
                input: "http://localhost:8080/simple/price?ids=bitcoin&vs_currencies=usd",
                valid: true,
            },
            TestCase {
                // TC2: relative url
                input: "api/v3/simple/price",
                valid: false,
            },
            TestCase {
                // TC3: websocket scheme
                input: "wss://api.coingecko.com/api/v3/simple/price",
                valid: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            match CoinGeckoRateSource::new(test.input) {
                Ok(source) => {
                    assert!(test.valid, "TC{} failed", index);
                    assert_eq!(source.url().as_str(), test.input, "TC{} failed", index);
                }
                Err(error) => {
                    assert!(!test.valid, "TC{} failed: {}", index, error);
                    assert!(matches!(error, PriceError::Url(_)), "TC{} failed", index);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_rate_is_zero_before_first_refresh() {
        let oracle = PriceOracle::new(ScriptedRates::new([]), Duration::from_secs(60));

        assert_eq!(oracle.current_rate(), Decimal::ZERO);
        let snapshot = oracle.snapshot();
        assert!(snapshot.stale);
        assert_eq!(snapshot.fetched_at, None);
    }

    #[tokio::test]
    async fn test_failed_refresh_retains_previous_rate() {
        let oracle = PriceOracle::new(
            ScriptedRates::new([Ok(dec!(64250.5)), Err(PriceError::Status(429))]),
            Duration::from_secs(60),
        );

        assert_eq!(oracle.refresh().await, Ok(dec!(64250.5)));
        assert!(!oracle.snapshot().stale);

        assert_eq!(oracle.refresh().await, Err(PriceError::Status(429)));
        assert_eq!(oracle.current_rate(), dec!(64250.5));
        assert!(oracle.snapshot().stale);
        assert!(oracle.snapshot().fetched_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_retried_on_next_tick_only() {
        let source = ScriptedRates::new([
            Err(PriceError::Http("connection reset".to_string())),
            Ok(dec!(61000)),
        ]);
        let oracle = Arc::new(PriceOracle::new(source.clone(), Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(oracle.clone().run(cancel.clone()));

        // Immediate first tick fails, nothing else happens until the period elapses
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(oracle.current_rate(), Decimal::ZERO);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(oracle.current_rate(), dec!(61000));

        cancel.cancel();
        task.await.unwrap();
    }
}
