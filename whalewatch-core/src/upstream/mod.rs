//! Upstream transaction feed.
//!
//! A [`FeedClient`] owns one persistent subscription obtained from an [`UpstreamConnector`] and
//! hides every disconnect behind an explicit reconnect state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Disconnected -> ... -> Stopped
//! ```
//!
//! Callers only observe gaps in the message stream, never a terminal error. `Stopped` is reached
//! exclusively through [`FeedClient::stop`].

use crate::{
    error::FeedError,
    event::{Block, Transaction},
};
use async_trait::async_trait;
use derive_more::Display;
use futures::{StreamExt, stream::BoxStream};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Blockchain.com WebSocket connector.
pub mod blockchain_info;

/// Message decoded from the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    Transaction(Transaction),
    Block(Block),
}

/// Stream of decoded messages for a single upstream connection. Ending the stream, or yielding
/// a terminal [`FeedError`], means the connection is gone.
pub type UpstreamStream = BoxStream<'static, Result<UpstreamMessage, FeedError>>;

/// Capability to open a subscribed upstream connection.
///
/// Dropping the returned stream must release the underlying socket.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<UpstreamStream, FeedError>;
}

#[async_trait]
impl<C> UpstreamConnector for Arc<C>
where
    C: UpstreamConnector,
{
    async fn connect(&self) -> Result<UpstreamStream, FeedError> {
        C::connect(self).await
    }
}

/// Receiver of decoded upstream messages, invoked once per message in receipt order.
pub trait FeedHandler: Send + 'static {
    fn on_transaction(&mut self, transaction: Transaction);

    fn on_block(&mut self, block: Block);
}

/// Observable state of a [`FeedClient`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    Stopped,
}

/// Exponential reconnect backoff with equal jitter.
///
/// The n-th consecutive failure waits somewhere in `[d/2, d]` where `d = min(base * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            jitter: true,
        }
    }

    /// Disable jitter, making every delay deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait before the next attempt. Advances the exponential schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        if !self.jitter {
            return delay;
        }

        let half = delay / 2;
        let spread = u64::try_from((delay - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Return to the base delay after a healthy connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// [`FeedClient`] reconnect and liveness settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub backoff: Backoff,
    /// Silence tolerated on a subscribed connection before it is treated as lost.
    pub read_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            read_timeout: Duration::from_secs(120),
        }
    }
}

/// Persistent, self-healing subscription to the upstream feed.
#[derive(Debug)]
pub struct FeedClient {
    state_rx: watch::Receiver<FeedState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedClient {
    /// Spawn the feed task. The handler is invoked from that task only.
    pub fn start<C, H>(connector: C, settings: FeedSettings, handler: H) -> Self
    where
        C: UpstreamConnector,
        H: FeedHandler,
    {
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feed(
            connector,
            settings,
            handler,
            state_tx,
            cancel.clone(),
        ));

        Self {
            state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<FeedState> {
        self.state_rx.clone()
    }

    /// Cancel any in-flight connect or backoff, close the socket and wait for the feed task to
    /// finish. Once this returns the handler has been dropped and will never run again.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "upstream feed task did not shut down cleanly");
            }
        }
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn dispatch<H: FeedHandler>(handler: &mut H, message: UpstreamMessage) {
    match message {
        UpstreamMessage::Transaction(transaction) => handler.on_transaction(transaction),
        UpstreamMessage::Block(block) => handler.on_block(block),
    }
}

/// Main upstream loop with auto-reconnect.
async fn run_feed<C, H>(
    connector: C,
    settings: FeedSettings,
    mut handler: H,
    state_tx: watch::Sender<FeedState>,
    cancel: CancellationToken,
) where
    C: UpstreamConnector,
    H: FeedHandler,
{
    let FeedSettings {
        mut backoff,
        read_timeout,
    } = settings;

    info!("starting upstream feed client");

    loop {
        state_tx.send_replace(FeedState::Connecting);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connector.connect() => result,
        };

        match connected {
            Ok(mut stream) => {
                state_tx.send_replace(FeedState::Subscribed);
                info!("subscribed to upstream feed");

                let mut delivered = 0u64;
                let lost = loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = tokio::time::timeout(read_timeout, stream.next()) => Some(next),
                    };

                    let Some(next) = next else {
                        break None;
                    };

                    match next {
                        Err(_elapsed) => break Some(FeedError::ReadTimeout(read_timeout)),
                        Ok(None) => break Some(FeedError::Closed),
                        Ok(Some(Ok(message))) => {
                            if delivered == 0 {
                                backoff.reset();
                            }
                            delivered += 1;
                            dispatch(&mut handler, message);
                        }
                        Ok(Some(Err(error))) if !error.is_terminal() => {
                            warn!(%error, "dropping malformed upstream payload");
                        }
                        Ok(Some(Err(error))) => break Some(error),
                    }
                };

                // Closes the socket before any backoff wait
                drop(stream);

                match lost {
                    None => break,
                    Some(error) => warn!(%error, delivered, "upstream connection lost"),
                }
            }
            Err(error) => {
                warn!(%error, "failed to connect to upstream feed");
            }
        }

        state_tx.send_replace(FeedState::Disconnected);

        let delay = backoff.next_delay();
        debug!(?delay, "waiting before reconnecting to upstream feed");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(FeedState::Stopped);
    info!("upstream feed client stopped");
}
