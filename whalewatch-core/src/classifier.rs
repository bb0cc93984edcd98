use crate::{
    config::SharedConfig,
    event::{Transaction, WhaleEvent},
    price::PriceOracle,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Classify a transaction against a whale threshold (BTC) using a fiat `rate`.
///
/// Emits a [`WhaleEvent`] iff the transaction value meets or exceeds the threshold.
pub fn classify(
    transaction: &Transaction,
    threshold: Decimal,
    rate: Decimal,
) -> Option<WhaleEvent> {
    let value_base = transaction.value_btc();
    if value_base < threshold {
        return None;
    }

    Some(WhaleEvent {
        hash: transaction.hash.clone(),
        value_base,
        value_fiat: value_base * rate,
        address: transaction.address.clone(),
        timestamp: transaction.time.unwrap_or_else(Utc::now),
    })
}

/// Classifies live transactions against the configuration and rate in effect right now.
#[derive(Debug, Clone)]
pub struct ActivityClassifier {
    config: SharedConfig,
    oracle: Arc<PriceOracle>,
}

impl ActivityClassifier {
    pub fn new(config: SharedConfig, oracle: Arc<PriceOracle>) -> Self {
        Self { config, oracle }
    }

    /// Takes exactly one config snapshot and one rate read for this transaction.
    pub fn classify(&self, transaction: &Transaction) -> Option<WhaleEvent> {
        let threshold = self.config.snapshot().threshold;
        classify(transaction, threshold, self.oracle.current_rate())
    }
}
