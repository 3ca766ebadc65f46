pub mod loki;

use crate::stats::ForwardingStats;
use crate::types::{DeliveryOutcome, LogRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

pub use loki::{LokiClient, LokiClientConfig};

/// Delivers one record to the remote sink and reports how it went.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, record: LogRecord) -> DeliveryOutcome;
}

/// Context handed to a [`DeliveryObserver`] for each failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub outcome: DeliveryOutcome,
    /// Number of records the failed attempt carried.
    pub records: usize,
    pub endpoint: String,
}

pub trait DeliveryObserver: Send + Sync {
    fn on_failure(&self, failure: &DeliveryFailure);
}

/// Logs every failed attempt and counts it.
pub struct LoggingObserver {
    stats: Arc<ForwardingStats>,
}

impl LoggingObserver {
    pub fn new(stats: Arc<ForwardingStats>) -> Self {
        Self { stats }
    }
}

impl DeliveryObserver for LoggingObserver {
    fn on_failure(&self, failure: &DeliveryFailure) {
        self.stats.record_delivery_failure();
        error!(
            "push client delivery error ({} record(s) to {}): {}",
            failure.records, failure.endpoint, failure.outcome
        );
    }
}
