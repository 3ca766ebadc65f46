use crate::dedup::{DedupGuard, DedupKey};
use crate::encoder::{EncodeError, RecordEncoder};
use crate::labels::LabelEnricher;
use crate::leader::LeaderGate;
use crate::retry::RetryPolicy;
use crate::sink::Deliver;
use crate::stats::ForwardingStats;
use crate::types::{ClusterEvent, DeliveryOutcome, ObjectKey};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Read access to the current state of events in the cluster.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// `Ok(None)` when the event no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterEvent>, SourceError>;
}

#[derive(Debug, Error)]
#[error("failed to read event {key}: {message}")]
pub struct SourceError {
    pub key: ObjectKey,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Success,
    Requeue(Duration),
}

/// Retry state of the occurrence currently being delivered for one object.
#[derive(Debug, Clone, Copy)]
struct Attempts {
    dedup_key: DedupKey,
    failures: u32,
    updated: Instant,
}

/// Failure counts per object, bounded by capacity and age.
///
/// The controller never reconciles an object that left its store, so an
/// event deleted mid-retry is only cleared from here by eviction.
struct RetryLedger {
    capacity: usize,
    ttl: Duration,
    // Ordered least recently failed first.
    entries: IndexMap<ObjectKey, Attempts>,
}

impl RetryLedger {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: IndexMap::new(),
        }
    }

    /// Failed attempts so far for the occurrence `dedup_key`, including this one.
    fn record_failure(&mut self, key: &ObjectKey, dedup_key: DedupKey) -> u32 {
        let now = Instant::now();
        let failures = match self.entries.shift_remove(key) {
            Some(previous)
                if previous.dedup_key == dedup_key
                    && now.duration_since(previous.updated) < self.ttl =>
            {
                previous.failures + 1
            }
            _ => 1,
        };
        self.entries.insert(
            key.clone(),
            Attempts {
                dedup_key,
                failures,
                updated: now,
            },
        );

        while let Some((_, oldest)) = self.entries.first()
            && now.duration_since(oldest.updated) >= self.ttl
        {
            self.entries.shift_remove_index(0);
        }
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
        failures
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.entries.shift_remove(key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct EventReconciler {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn Deliver>,
    gate: Arc<dyn LeaderGate>,
    dedup: Arc<DedupGuard>,
    // Occurrences given up on; same bounds as `dedup`, never marked forwarded.
    dropped: DedupGuard,
    enricher: LabelEnricher,
    encoder: RecordEncoder,
    retry: RetryPolicy,
    stats: Arc<ForwardingStats>,
    attempts: Mutex<RetryLedger>,
}

impl EventReconciler {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn Deliver>,
        gate: Arc<dyn LeaderGate>,
        dedup: Arc<DedupGuard>,
        enricher: LabelEnricher,
        retry: RetryPolicy,
        stats: Arc<ForwardingStats>,
    ) -> Self {
        let dropped = DedupGuard::new(dedup.capacity(), dedup.ttl());
        let attempts = RetryLedger::new(dedup.capacity(), dedup.ttl());
        Self {
            source,
            sink,
            gate,
            dedup,
            dropped,
            enricher,
            encoder: RecordEncoder,
            retry,
            stats,
            attempts: Mutex::new(attempts),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn stats(&self) -> &ForwardingStats {
        &self.stats
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        if !self.gate.is_active() {
            debug!("[{}] Not leading, skipping", key);
            return Ok(ReconcileOutcome::Success);
        }

        let Some(event) = self.source.get(key).await? else {
            debug!("[{}] Event no longer exists", key);
            self.forget(key);
            self.stats.record_vanished();
            return Ok(ReconcileOutcome::Success);
        };

        let dedup_key = DedupKey::of(&event);
        if self.dedup.has_forwarded(&dedup_key) {
            debug!("[{}] Already forwarded as {}", key, dedup_key);
            self.forget(key);
            self.stats.record_deduplicated();
            return Ok(ReconcileOutcome::Success);
        }
        if self.dropped.has_forwarded(&dedup_key) {
            debug!("[{}] Already dropped as {}", key, dedup_key);
            self.forget(key);
            self.stats.record_deduplicated();
            return Ok(ReconcileOutcome::Success);
        }

        let labels = self.enricher.enrich(&event);
        let record = self.encoder.encode(&event, labels)?;

        // Leadership may have been revoked while we were reading.
        if !self.gate.is_active() {
            debug!("[{}] Leadership revoked before delivery, skipping", key);
            return Ok(ReconcileOutcome::Success);
        }

        match self.sink.deliver(record).await {
            DeliveryOutcome::Delivered => {
                self.dedup.mark_forwarded(dedup_key);
                self.forget(key);
                self.stats.record_forwarded();
                debug!("[{}] Forwarded {} ({})", key, dedup_key, event.reason);
                Ok(ReconcileOutcome::Success)
            }
            DeliveryOutcome::TransientFailure(reason) => {
                let failures = self.record_failure(key, dedup_key);
                if self.retry.is_exhausted(failures) {
                    self.dropped.mark_forwarded(dedup_key);
                    self.forget(key);
                    self.stats.record_dropped_retry_exhausted();
                    warn!(
                        "[{}] Dropping event after {} failed attempts (retry exhausted): {}",
                        key, failures, reason
                    );
                    return Ok(ReconcileOutcome::Success);
                }
                let delay = self.retry.delay(failures - 1, dedup_key.as_u64());
                self.stats.record_retry_scheduled();
                info!(
                    "[{}] Delivery failed (attempt {}/{}), retrying in {:?}: {}",
                    key, failures, self.retry.max_attempts, delay, reason
                );
                Ok(ReconcileOutcome::Requeue(delay))
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                self.dropped.mark_forwarded(dedup_key);
                self.forget(key);
                self.stats.record_dropped_permanent();
                error!("[{}] Dropping event rejected by the push gateway: {}", key, reason);
                Ok(ReconcileOutcome::Success)
            }
        }
    }

    fn record_failure(&self, key: &ObjectKey, dedup_key: DedupKey) -> u32 {
        self.ledger().record_failure(key, dedup_key)
    }

    fn forget(&self, key: &ObjectKey) {
        self.ledger().forget(key);
    }

    /// Number of objects with a retry in progress.
    pub fn pending_retries(&self) -> usize {
        self.ledger().len()
    }

    fn ledger(&self) -> MutexGuard<'_, RetryLedger> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}
