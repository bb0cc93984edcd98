//! # WhaleWatch Core
//! Ingestion engine and multi-client event broadcaster for real-time Bitcoin whale monitoring.
//!
//! * **Upstream**: persistent subscription to an unconfirmed transaction & block feed with an
//!   explicit reconnect state machine and jittered exponential backoff.
//! * **Classification**: every transaction is valued against the whale threshold and the latest
//!   fiat rate, reading one atomically swapped configuration snapshot.
//! * **Aggregation**: per-interval summaries, emitted even when a window saw no traffic.
//! * **Fan-out**: every event is delivered in the same order to any number of independently
//!   paced sessions, each with a bounded drop-oldest queue.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use url::Url;
//! use whalewatch_core::{
//!     EngineSettings, WhaleWatch,
//!     price::{CoinGeckoRateSource, DEFAULT_COINGECKO_URL},
//!     upstream::blockchain_info::{BlockchainInfoConnector, DEFAULT_BLOCKCHAIN_INFO_URL},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = BlockchainInfoConnector::new(Url::parse(DEFAULT_BLOCKCHAIN_INFO_URL)?);
//!     let prices = Arc::new(CoinGeckoRateSource::new(DEFAULT_COINGECKO_URL)?);
//!
//!     let engine = WhaleWatch::start(EngineSettings::default(), connector, prices)?;
//!     let mut session = engine.subscribe();
//!
//!     while let Some(event) = session.next_event().await {
//!         println!("{} #{}", event.kind.name(), event.sequence);
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Periodic aggregation of observed transactions into summary events.
pub mod aggregation;

/// Bounded per-session fan-out of broadcast events.
pub mod broadcast;

/// Whale classification of individual transactions.
pub mod classifier;

/// Atomically swapped runtime configuration and engine settings.
pub mod config;

/// Engine wiring all components together.
pub mod engine;

/// All errors generated in `whalewatch-core`.
pub mod error;

/// Feed inputs and broadcast event payloads.
pub mod event;

/// Fiat conversion rate oracle.
pub mod price;

/// Upstream feed client and connectors.
pub mod upstream;

pub use broadcast::{EventBroadcaster, SessionHandle, SessionId, SessionState};
pub use config::{ConfigUpdate, EngineSettings, SharedConfig, WatchConfig};
pub use engine::{EngineStatus, WhaleWatch};
pub use event::{BroadcastEvent, EventKind};

