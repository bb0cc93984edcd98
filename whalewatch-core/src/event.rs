use crate::config::WatchConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Number of decimal places between satoshis and BTC.
pub const BTC_SCALE: u32 = 8;

/// Convert an integer satoshi amount into an exact BTC [`Decimal`].
pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(sats), BTC_SCALE)
}

/// Unconfirmed transaction observed on the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub hash: String,
    /// Sum of all outputs in satoshis.
    pub value_sats: u64,
    /// Address of the first output, if the upstream provided one.
    pub address: Option<String>,
    /// Timestamp reported by the upstream, if any.
    pub time: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub observed_instant: Instant,
}

impl Transaction {
    pub fn new(hash: impl Into<String>, value_sats: u64, address: Option<String>) -> Self {
        Self {
            hash: hash.into(),
            value_sats,
            address,
            time: None,
            observed_at: Utc::now(),
            observed_instant: Instant::now(),
        }
    }

    pub fn with_time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.time = time;
        self
    }

    pub fn value_btc(&self) -> Decimal {
        sats_to_btc(self.value_sats)
    }
}

/// Block announcement observed on the upstream feed.
///
/// Heights are display-only: they may go backwards under a reorg and are never corrected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: Option<u64>,
    pub tx_count: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

impl Block {
    pub fn new(height: Option<u64>, tx_count: Option<u64>) -> Self {
        Self {
            height,
            tx_count,
            observed_at: Utc::now(),
        }
    }
}

/// Transaction whose value met the whale threshold.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WhaleEvent {
    pub hash: String,
    pub value_base: Decimal,
    pub value_fiat: Decimal,
    pub address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Statistics for one elapsed aggregation window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SummaryEvent {
    pub count: u64,
    pub total_base: Decimal,
    pub avg_base: Decimal,
    pub total_fiat: Decimal,
    pub avg_fiat: Decimal,
    pub whale_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockEvent {
    pub height: Option<u64>,
    pub tx_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl From<Block> for BlockEvent {
    fn from(block: Block) -> Self {
        Self {
            height: block.height,
            tx_count: block.tx_count,
            timestamp: block.observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigEvent {
    pub threshold: Decimal,
    pub interval_secs: u64,
}

impl From<WatchConfig> for ConfigEvent {
    fn from(config: WatchConfig) -> Self {
        Self {
            threshold: config.threshold,
            interval_secs: config.interval_secs,
        }
    }
}

/// Payload of a [`BroadcastEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Whale(WhaleEvent),
    Summary(SummaryEvent),
    Block(BlockEvent),
    Config(ConfigEvent),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Whale(_) => "whale",
            EventKind::Summary(_) => "summary",
            EventKind::Block(_) => "block",
            EventKind::Config(_) => "config",
        }
    }
}

impl From<WhaleEvent> for EventKind {
    fn from(event: WhaleEvent) -> Self {
        Self::Whale(event)
    }
}

impl From<SummaryEvent> for EventKind {
    fn from(event: SummaryEvent) -> Self {
        Self::Summary(event)
    }
}

impl From<BlockEvent> for EventKind {
    fn from(event: BlockEvent) -> Self {
        Self::Block(event)
    }
}

impl From<ConfigEvent> for EventKind {
    fn from(event: ConfigEvent) -> Self {
        Self::Config(event)
    }
}

/// Event as delivered to sessions, stamped with the broadcaster's sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sats_to_btc_is_exact() {
        assert_eq!(sats_to_btc(0), dec!(0));
        assert_eq!(sats_to_btc(1), dec!(0.00000001));
        assert_eq!(sats_to_btc(15_000_000_000), dec!(150));
        assert_eq!(sats_to_btc(2_100_000_000_000_000), dec!(21000000));
    }

    #[test]
    fn test_broadcast_event_serialises_tagged() {
        let event = BroadcastEvent {
            sequence: 7,
            kind: EventKind::Config(ConfigEvent {
                threshold: dec!(50),
                interval_secs: 30,
            }),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["type"], "config");
        assert_eq!(json["data"]["interval_secs"], 30);
        assert_eq!(json["data"]["threshold"], 50.0);
    }
}
