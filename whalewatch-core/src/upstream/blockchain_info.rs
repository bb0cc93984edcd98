use super::{UpstreamConnector, UpstreamMessage, UpstreamStream};
use crate::{
    error::FeedError,
    event::{Block, Transaction},
};
use async_trait::async_trait;
use chrono::DateTime;
use futures::{SinkExt, StreamExt, stream};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

/// Default Blockchain.com WebSocket endpoint.
pub const DEFAULT_BLOCKCHAIN_INFO_URL: &str = "wss://ws.blockchain.info/inv";

/// Subscription requests sent on every (re)connect.
const SUBSCRIBE_OPS: [&str; 3] = ["unconfirmed_sub", "blocks_sub", "ping"];

/// [`UpstreamConnector`] for the Blockchain.com unconfirmed transaction and block feed.
#[derive(Debug, Clone)]
pub struct BlockchainInfoConnector {
    url: Url,
    ping_interval: Duration,
}

impl BlockchainInfoConnector {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ping_interval: Duration::from_secs(30),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpstreamConnector for BlockchainInfoConnector {
    async fn connect(&self) -> Result<UpstreamStream, FeedError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|error| FeedError::Connect(error.to_string()))?;

        info!(url = %self.url, "connected to Blockchain.com feed");

        let (mut write, read) = ws_stream.split();

        for op in SUBSCRIBE_OPS {
            let request = serde_json::json!({ "op": op }).to_string();
            write
                .send(Message::Text(request.into()))
                .await
                .map_err(|error| FeedError::Subscribe(error.to_string()))?;
        }

        let mut keepalive =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Reading and keepalive pings share one stream so dropping it releases the whole socket
        let messages = stream::unfold(
            Some((read, write, keepalive)),
            |connection| async move {
                let (mut read, mut write, mut keepalive) = connection?;

                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            if let Err(error) = write.send(Message::Ping(Vec::new().into())).await {
                                return Some((Err(FeedError::from(error)), None));
                            }
                        }
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                                Ok(Some(message)) => {
                                    return Some((Ok(message), Some((read, write, keepalive))));
                                }
                                Ok(None) => continue,
                                Err(error) => {
                                    return Some((Err(error), Some((read, write, keepalive))));
                                }
                            },
                            Some(Ok(Message::Close(frame))) => {
                                debug!(?frame, "Blockchain.com feed sent close frame");
                                return None;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(error)) => return Some((Err(FeedError::from(error)), None)),
                            None => return None,
                        },
                    }
                }
            },
        );

        Ok(messages.boxed())
    }
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    hash: String,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    out: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    addr: Option<String>,
}

impl RawOutput {
    /// Output value in satoshis. Values that are not non-negative integers are skipped.
    fn sats(&self) -> Option<u64> {
        match &self.value {
            Value::Number(number) => number.as_u64(),
            Value::String(string) => string.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(default)]
    height: Option<u64>,
    #[serde(default, rename = "nTx")]
    n_tx: Option<u64>,
}

impl From<RawTransaction> for Transaction {
    fn from(raw: RawTransaction) -> Self {
        let value_sats = raw
            .out
            .iter()
            .filter_map(RawOutput::sats)
            .fold(0u64, u64::saturating_add);
        let address = raw.out.first().and_then(|output| output.addr.clone());
        let time = raw
            .time
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Transaction::new(raw.hash, value_sats, address).with_time(time)
    }
}

/// Decode one Blockchain.com text frame.
///
/// Returns `Ok(None)` for frames that carry no feed data (eg/ `pong`).
pub fn parse_message(text: &str) -> Result<Option<UpstreamMessage>, FeedError> {
    let mut value = serde_json::from_str::<Value>(text)
        .map_err(|error| FeedError::Parse(error.to_string()))?;

    let op = value
        .get("op")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| FeedError::Parse(format!("missing op in frame: {text}")))?;

    let payload = value.get_mut("x").map(Value::take).unwrap_or(Value::Null);

    match op.as_str() {
        "utx" => serde_json::from_value::<RawTransaction>(payload)
            .map(|raw| Some(UpstreamMessage::Transaction(Transaction::from(raw))))
            .map_err(|error| FeedError::Parse(format!("utx: {error}"))),
        "block" => serde_json::from_value::<RawBlock>(payload)
            .map(|raw| Some(UpstreamMessage::Block(Block::new(raw.height, raw.n_tx))))
            .map_err(|error| FeedError::Parse(format!("block: {error}"))),
        other => {
            debug!(op = other, "ignoring Blockchain.com frame");
            Ok(None)
        }
    }
}
