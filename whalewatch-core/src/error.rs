use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration update. The previous configuration stays in effect.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum ConfigError {
    #[error(
        "invalid whale threshold {0}: must be positive and at most {max} BTC",
        max = crate::config::MAX_THRESHOLD_BTC
    )]
    InvalidThreshold(Decimal),

    #[error(
        "invalid summary interval {0}s: must be between 1 and {max} seconds",
        max = crate::config::MAX_INTERVAL_SECS
    )]
    InvalidInterval(u64),
}

/// All errors generated while talking to the upstream transaction feed.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum FeedError {
    #[error("failed to connect to upstream feed: {0}")]
    Connect(String),

    #[error("failed to send subscription request: {0}")]
    Subscribe(String),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("upstream closed the connection")]
    Closed,

    #[error("upstream read timeout: no data received for {} seconds", .0.as_secs())]
    ReadTimeout(Duration),

    #[error("malformed upstream payload: {0}")]
    Parse(String),
}

impl FeedError {
    /// Determine if an error requires the upstream connection to be re-established.
    ///
    /// Malformed payloads only cost the offending message, everything else means the socket
    /// can no longer be trusted.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::Parse(_) => false,
            _ => true,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

/// Errors produced by a [`RateSource`](crate::price::RateSource) refresh.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum PriceError {
    #[error("price request failed: {0}")]
    Http(String),

    #[error("price service responded with status {0}")]
    Status(u16),

    #[error("price response could not be parsed: {0}")]
    Parse(String),

    #[error("price service returned a non-positive rate: {0}")]
    InvalidRate(Decimal),

    #[error("invalid price service url: {0}")]
    Url(String),
}

impl From<reqwest::Error> for PriceError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::Status(status.as_u16()),
            None if value.is_decode() => Self::Parse(value.to_string()),
            None => Self::Http(value.to_string()),
        }
    }
}

/// Fatal errors raised while constructing the engine. These are propagated to the process
/// boundary rather than recovered.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid initial configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid engine settings: {0}")]
    Settings(String),

    #[error("failed to initialise price source: {0}")]
    Price(#[from] PriceError),

    #[error("invalid upstream url: {0}")]
    Url(String),

}
