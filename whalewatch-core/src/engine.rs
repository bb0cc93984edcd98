use crate::{
    aggregation::{AggregationWindow, run_summary_timer},
    broadcast::{EventBroadcaster, SessionHandle, SessionId},
    classifier::ActivityClassifier,
    config::{ConfigUpdate, EngineSettings, SharedConfig, WatchConfig},
    error::{ConfigError, EngineError},
    event::{Block, BlockEvent, ConfigEvent, Transaction},
    price::{CoinGeckoRateSource, PriceOracle, RateSnapshot, RateSource},
    upstream::{
        Backoff, FeedClient, FeedHandler, FeedSettings, FeedState, UpstreamConnector,
        blockchain_info::BlockchainInfoConnector,
    },
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use url::Url;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time health view of a running [`WhaleWatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub running: bool,
    pub feed: FeedState,
    pub sessions: usize,
    pub published: u64,
    /// Height of the latest block announcement seen. Display-only, not reorg aware.
    pub latest_block_height: Option<u64>,
    pub rate: RateSnapshot,
    pub config: WatchConfig,
}

impl EngineStatus {
    /// Running and currently subscribed upstream.
    pub fn is_healthy(&self) -> bool {
        self.running && self.feed == FeedState::Subscribed
    }
}

/// Routes upstream messages through classification and aggregation into the broadcaster.
#[derive(Debug)]
struct Ingest {
    classifier: ActivityClassifier,
    window: Arc<AggregationWindow>,
    broadcaster: Arc<EventBroadcaster>,
    latest_height: Arc<AtomicU64>,
}

impl FeedHandler for Ingest {
    fn on_transaction(&mut self, transaction: Transaction) {
        let whale = self.classifier.classify(&transaction);
        self.window.observe(&transaction, whale.is_some());

        if let Some(whale) = whale {
            info!(
                hash = %whale.hash,
                value_base = %whale.value_base,
                value_fiat = %whale.value_fiat.round_dp(2),
                "whale transaction"
            );
            self.broadcaster.publish(whale);
        }
    }

    fn on_block(&mut self, block: Block) {
        if let Some(height) = block.height {
            self.latest_height.store(height, Ordering::Relaxed);
        }
        info!(height = ?block.height, tx_count = ?block.tx_count, "new block");
        self.broadcaster.publish(BlockEvent::from(block));
    }
}

/// The ingestion engine: upstream feed, fiat rate refresh, summary timer and broadcaster.
#[derive(Debug)]
pub struct WhaleWatch {
    config: SharedConfig,
    oracle: Arc<PriceOracle>,
    window: Arc<AggregationWindow>,
    broadcaster: Arc<EventBroadcaster>,
    latest_height: Arc<AtomicU64>,
    feed: Mutex<Option<FeedClient>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WhaleWatch {
    /// Validate `settings` and spawn every engine task on the current tokio runtime.
    pub fn start<C>(
        settings: EngineSettings,
        connector: C,
        rate_source: Arc<dyn RateSource>,
    ) -> Result<Self, EngineError>
    where
        C: UpstreamConnector,
    {
        settings.validate()?;

        let config = SharedConfig::new(settings.config)?;
        let oracle = Arc::new(PriceOracle::new(rate_source, settings.price_refresh));
        let window = Arc::new(AggregationWindow::new());
        let broadcaster = Arc::new(EventBroadcaster::new(
            settings.session_capacity,
            settings.replay_size,
            settings.drain_grace,
        ));
        let latest_height = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        info!(
            threshold = %settings.config.threshold,
            interval_secs = settings.config.interval_secs,
            session_capacity = settings.session_capacity,
            "starting WhaleWatch engine"
        );

        let tasks = vec![
            tokio::spawn(Arc::clone(&oracle).run(cancel.child_token())),
            tokio::spawn(run_summary_timer(
                Arc::clone(&window),
                config.clone(),
                Arc::clone(&oracle),
                Arc::clone(&broadcaster),
                cancel.child_token(),
            )),
        ];

        let feed = FeedClient::start(
            connector,
            FeedSettings {
                backoff: Backoff::new(settings.reconnect_base, settings.reconnect_max),
                read_timeout: settings.read_timeout,
            },
            Ingest {
                classifier: ActivityClassifier::new(config.clone(), Arc::clone(&oracle)),
                window: Arc::clone(&window),
                broadcaster: Arc::clone(&broadcaster),
                latest_height: Arc::clone(&latest_height),
            },
        );

        Ok(Self {
            config,
            oracle,
            window,
            broadcaster,
            latest_height,
            feed: Mutex::new(Some(feed)),
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Start against the Blockchain.com feed at `upstream_url`, valuing transactions with the
    /// CoinGecko endpoint at `price_url`.
    pub fn start_with_urls(
        settings: EngineSettings,
        upstream_url: &str,
        price_url: &str,
    ) -> Result<Self, EngineError> {
        let upstream_url = Url::parse(upstream_url)
            .map_err(|error| EngineError::Url(format!("{upstream_url}: {error}")))?;
        if !matches!(upstream_url.scheme(), "ws" | "wss") {
            return Err(EngineError::Url(format!(
                "unsupported scheme {}",
                upstream_url.scheme()
            )));
        }
        let rate_source = CoinGeckoRateSource::new(price_url)?;

        Self::start(
            settings,
            BlockchainInfoConnector::new(upstream_url),
            Arc::new(rate_source),
        )
    }

    /// Register a new client session.
    pub fn subscribe(&self) -> SessionHandle {
        self.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SessionId) {
        self.broadcaster.unsubscribe(id);
    }

    /// Apply a configuration update and announce the effective configuration to every session.
    ///
    /// An invalid update is rejected and the previous configuration stays in effect.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<WatchConfig, ConfigError> {
        match self.config.update(update) {
            Ok(effective) => {
                info!(
                    threshold = %effective.threshold,
                    interval_secs = effective.interval_secs,
                    "configuration updated"
                );
                self.broadcaster.publish(ConfigEvent::from(effective));
                Ok(effective)
            }
            Err(error) => {
                warn!(%error, ?update, "rejected configuration update");
                Err(error)
            }
        }
    }

    pub fn config(&self) -> WatchConfig {
        self.config.snapshot()
    }

    /// Watch the effective configuration, starting from the current snapshot.
    pub fn config_changes(&self) -> watch::Receiver<WatchConfig> {
        self.config.subscribe()
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn status(&self) -> EngineStatus {
        let feed = self
            .feed
            .lock()
            .as_ref()
            .map_or(FeedState::Stopped, FeedClient::state);
        let latest_block_height = match self.latest_height.load(Ordering::Relaxed) {
            0 => None,
            height => Some(height),
        };

        EngineStatus {
            running: !self.cancel.is_cancelled() && feed != FeedState::Stopped,
            feed,
            sessions: self.broadcaster.session_count(),
            published: self.broadcaster.published(),
            latest_block_height,
            rate: self.oracle.snapshot(),
            config: self.config.snapshot(),
        }
    }

    /// Stop the feed, timers and price refresh, then drain and close every session.
    ///
    /// Returns once every engine task has finished. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        info!("shutting down WhaleWatch engine");
        self.cancel.cancel();

        let feed = self.feed.lock().take();
        if let Some(feed) = feed {
            feed.stop().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "engine task did not shut down cleanly");
            }
        }

        self.broadcaster.close_all().await;

        debug!(
            unreported = self.window.pending_count(),
            "WhaleWatch engine stopped"
        );
    }
}

impl Drop for WhaleWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
