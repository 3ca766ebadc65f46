use crate::types::{ClusterEvent, LogRecord};
use chrono::Utc;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to encode event {namespace}/{name}: {source}")]
pub struct EncodeError {
    pub namespace: String,
    pub name: String,
    #[source]
    pub source: serde_json::Error,
}

/// Turns events into log records. The payload is the JSON form of the
/// event, so equal events always produce equal bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordEncoder;

impl RecordEncoder {
    pub fn encode(
        &self,
        event: &ClusterEvent,
        labels: BTreeMap<String, String>,
    ) -> Result<LogRecord, EncodeError> {
        let payload = serde_json::to_string(event).map_err(|source| EncodeError {
            namespace: event.namespace.clone(),
            name: event.name.clone(),
            source,
        })?;
        let timestamp = event
            .last_seen
            .or(event.first_seen)
            .unwrap_or_else(Utc::now);
        Ok(LogRecord::new(timestamp, labels, payload))
    }
}
