//! Per-interval activity statistics.
//!
//! [`AggregationWindow`] serialises `observe` and `tick` on one lock, so every transaction is
//! attributed to exactly one window. [`run_summary_timer`] drives `tick` once per configured
//! interval and publishes the resulting [`SummaryEvent`], including empty windows.

use crate::{
    broadcast::EventBroadcaster,
    config::SharedConfig,
    event::{BTC_SCALE, SummaryEvent, Transaction},
    price::PriceOracle,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct WindowCounters {
    count: u64,
    total_sats: u128,
    whale_count: u64,
    started_at: DateTime<Utc>,
}

impl WindowCounters {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            total_sats: 0,
            whale_count: 0,
            started_at,
        }
    }
}

#[derive(Debug)]
pub struct AggregationWindow {
    counters: Mutex<WindowCounters>,
}

impl Default for AggregationWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationWindow {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(WindowCounters::new(Utc::now())),
        }
    }

    /// Accumulate a transaction into the current window.
    pub fn observe(&self, transaction: &Transaction, is_whale: bool) {
        let mut counters = self.counters.lock();
        counters.count += 1;
        counters.total_sats += u128::from(transaction.value_sats);
        if is_whale {
            counters.whale_count += 1;
        }
    }

    /// Atomically snapshot and reset the counters, returning the closed window as a summary.
    ///
    /// Fiat totals use `rate`, the conversion rate at emission time.
    pub fn tick(&self, rate: Decimal) -> SummaryEvent {
        let window_end = Utc::now();
        let closed = {
            let mut counters = self.counters.lock();
            std::mem::replace(&mut *counters, WindowCounters::new(window_end))
        };

        let total_base = i128::try_from(closed.total_sats)
            .ok()
            .and_then(|sats| Decimal::try_from_i128_with_scale(sats, BTC_SCALE).ok())
            .unwrap_or(Decimal::MAX);
        let avg_base = if closed.count == 0 {
            Decimal::ZERO
        } else {
            total_base / Decimal::from(closed.count)
        };

        SummaryEvent {
            count: closed.count,
            total_base,
            avg_base,
            total_fiat: total_base * rate,
            avg_fiat: avg_base * rate,
            whale_count: closed.whale_count,
            window_start: closed.started_at,
            window_end,
        }
    }

    /// Number of transactions observed so far in the current window.
    pub fn pending_count(&self) -> u64 {
        self.counters.lock().count
    }
}

/// Emit one summary per interval until cancelled.
///
/// The interval is read from `config` when each window opens, so a change made mid-window only
/// applies from the next window. Boundaries are scheduled from the previous deadline rather than
/// from wake-up time, so a late wake-up never skips or merges windows.
pub async fn run_summary_timer(
    window: Arc<AggregationWindow>,
    config: SharedConfig,
    oracle: Arc<PriceOracle>,
    broadcaster: Arc<EventBroadcaster>,
    cancel: CancellationToken,
) {
    let mut interval = config.snapshot().interval();
    let mut deadline = Instant::now() + interval;

    info!(?interval, "starting summary timer");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let summary = window.tick(oracle.current_rate());
        debug!(
            count = summary.count,
            whales = summary.whale_count,
            total_base = %summary.total_base,
            "summary window closed"
        );
        broadcaster.publish(summary);

        let next = config.snapshot().interval();
        if next != interval {
            info!(from = ?interval, to = ?next, "summary interval changed");
            interval = next;
        }
        deadline += interval;
    }

    debug!("summary timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConfigUpdate, WatchConfig},
        error::PriceError,
        event::{EventKind, sats_to_btc},
        price::RateSource,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::{
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        time::Duration,
    };

    const SATS: u64 = 100_000_000;

    fn tx(value_sats: u64) -> Transaction {
        Transaction::new("hash", value_sats, None)
    }

    #[test]
    fn test_tick_reports_exact_totals_and_resets() {
        let window = AggregationWindow::new();
        window.observe(&tx(150 * SATS), true);
        window.observe(&tx(50 * SATS), false);
        window.observe(&tx(1), false);

        let summary = window.tick(dec!(2));
        assert_eq!(summary.count, 3);
        assert_eq!(summary.whale_count, 1);
        assert_eq!(summary.total_base, dec!(200.00000001));
        assert_eq!(summary.avg_base, dec!(200.00000001) / dec!(3));
        assert_eq!(summary.total_fiat, dec!(400.00000002));
        assert!(summary.window_start <= summary.window_end);

        let next = window.tick(dec!(2));
        assert_eq!(next.count, 0);
        assert_eq!(next.window_start, summary.window_end);
    }

    #[test]
    fn test_empty_window_still_produces_zero_summary() {
        let window = AggregationWindow::new();

        let summary = window.tick(dec!(65000));
        assert_eq!(summary.count, 0);
        assert_eq!(summary.total_base, Decimal::ZERO);
        assert_eq!(summary.avg_base, Decimal::ZERO);
        assert_eq!(summary.total_fiat, Decimal::ZERO);
        assert_eq!(summary.whale_count, 0);
    }

    #[test]
    fn test_concurrent_observe_and_tick_count_every_transaction_once() {
        let window = AggregationWindow::new();
        let done = AtomicBool::new(false);
        let ticked_count = AtomicU64::new(0);
        let ticked_total = Mutex::new(Decimal::ZERO);

        std::thread::scope(|scope| {
            let observers = (0..4u64)
                .map(|observer| {
                    let window = &window;
                    scope.spawn(move || {
                        for step in 0..5_000u64 {
                            window.observe(&tx(observer * 10 + step % 7 + 1), step % 100 == 0);
                        }
                    })
                })
                .collect::<Vec<_>>();

            let ticker = scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let summary = window.tick(Decimal::ONE);
                    ticked_count.fetch_add(summary.count, Ordering::Relaxed);
                    *ticked_total.lock() += summary.total_base;
                }
            });

            for observer in observers {
                observer.join().unwrap();
            }
            done.store(true, Ordering::Release);
            ticker.join().unwrap();
        });

        let last = window.tick(Decimal::ONE);
        let expected_total_sats = (0..4u64)
            .flat_map(|observer| (0..5_000u64).map(move |step| observer * 10 + step % 7 + 1))
            .sum::<u64>();

        assert_eq!(ticked_count.load(Ordering::Relaxed) + last.count, 20_000);
        assert_eq!(
            *ticked_total.lock() + last.total_base,
            sats_to_btc(expected_total_sats)
        );
    }

    struct FixedRate;

    #[async_trait]
    impl RateSource for FixedRate {
        async fn fetch_rate(&self) -> Result<Decimal, PriceError> {
            Ok(dec!(60000))
        }
    }

    fn summary_count(kind: &EventKind) -> u64 {
        match kind {
            EventKind::Summary(summary) => summary.count,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_emits_heartbeat_and_applies_interval_change_next_window() {
        let config = SharedConfig::new(WatchConfig::new(dec!(100), 60).unwrap()).unwrap();
        let oracle = Arc::new(PriceOracle::new(Arc::new(FixedRate), Duration::from_secs(60)));
        let broadcaster = Arc::new(EventBroadcaster::new(16, 0, Duration::ZERO));
        let window = Arc::new(AggregationWindow::new());
        let cancel = CancellationToken::new();
        let mut session = broadcaster.subscribe();

        let started = Instant::now();
        let timer = tokio::spawn(run_summary_timer(
            window.clone(),
            config.clone(),
            oracle,
            broadcaster.clone(),
            cancel.clone(),
        ));

        // Change lands mid-window: the first window still closes at 60s
        tokio::time::sleep(Duration::from_secs(10)).await;
        config.update(ConfigUpdate::interval_secs(15)).unwrap();
        window.observe(&tx(SATS), false);

        let first = session.next_event().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(summary_count(&first.kind), 1);

        let second = session.next_event().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(75));
        assert_eq!(summary_count(&second.kind), 0);

        cancel.cancel();
        timer.await.unwrap();
        assert_eq!(broadcaster.published(), 2);
    }
}
