use super::{Deliver, DeliveryFailure, DeliveryObserver};
use crate::types::{DeliveryOutcome, LogRecord};
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Path appended to a gateway URL given without one.
pub const PUSH_PATH: &str = "/loki/api/v1/push";

#[derive(Debug, Clone)]
pub struct LokiClientConfig {
    pub push_url: Url,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    /// Upper bound a caller waits for the outcome of one record.
    pub deliver_timeout: Duration,
    pub queue_capacity: usize,
}

struct Pending {
    record: LogRecord,
    reply: oneshot::Sender<DeliveryOutcome>,
}

/// Loki JSON push client.
///
/// Callers hand records to a single background worker which groups them
/// into batches; a batch goes out when it is full or when its oldest record
/// has waited `flush_interval`. Every record in a batch shares the batch's
/// outcome.
pub struct LokiClient {
    tx: mpsc::Sender<Pending>,
    endpoint: String,
    deliver_timeout: Duration,
    observer: Arc<dyn DeliveryObserver>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LokiClient {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: LokiClientConfig,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let worker = BatchWorker {
            http,
            push_url: config.push_url.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            observer: observer.clone(),
            rx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            tx,
            endpoint: config.push_url.to_string(),
            deliver_timeout: config.deliver_timeout,
            observer,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting records and flush whatever is queued, waiting at most `grace`.
    pub async fn close(&self, grace: Duration) {
        self.shutdown.cancel();
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(handle) = handle {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!("Push client drained"),
                Ok(Err(e)) => warn!("Push client worker failed: {}", e),
                Err(_) => warn!("Push client did not drain within {:?}", grace),
            }
        }
    }

    fn fail(&self, outcome: DeliveryOutcome) -> DeliveryOutcome {
        self.observer.on_failure(&DeliveryFailure {
            outcome: outcome.clone(),
            records: 1,
            endpoint: self.endpoint.clone(),
        });
        outcome
    }
}

#[async_trait]
impl Deliver for LokiClient {
    async fn deliver(&self, record: LogRecord) -> DeliveryOutcome {
        if self.shutdown.is_cancelled() {
            return self.fail(DeliveryOutcome::TransientFailure(
                "push client is closed".to_string(),
            ));
        }

        let (reply, rx) = oneshot::channel();
        // Err carries failures that never reached the worker's observer call.
        let exchange = async {
            if self.tx.send(Pending { record, reply }).await.is_err() {
                return Err("push client is closed");
            }
            rx.await.map_err(|_| "record dropped before delivery")
        };

        match tokio::time::timeout(self.deliver_timeout, exchange).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(reason)) => self.fail(DeliveryOutcome::TransientFailure(reason.to_string())),
            Err(_) => self.fail(DeliveryOutcome::TransientFailure(format!(
                "no delivery outcome within {:?}",
                self.deliver_timeout
            ))),
        }
    }
}

struct BatchWorker {
    http: reqwest::Client,
    push_url: Url,
    batch_size: usize,
    flush_interval: Duration,
    observer: Arc<dyn DeliveryObserver>,
    rx: mpsc::Receiver<Pending>,
    shutdown: CancellationToken,
}

impl BatchWorker {
    async fn run(mut self) {
        let mut batch: Vec<Pending> = Vec::with_capacity(self.batch_size);
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(pending) => {
                        if batch.is_empty() {
                            deadline = Instant::now() + self.flush_interval;
                        }
                        batch.push(pending);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                    self.flush(&mut batch).await;
                }
            }
        }

        // Drain: nothing new gets in, everything already queued goes out.
        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            batch.push(pending);
        }
        if !batch.is_empty() {
            debug!("Flushing {} queued record(s) on shutdown", batch.len());
        }
        while !batch.is_empty() {
            let rest = batch.split_off(batch.len().min(self.batch_size));
            self.flush(&mut batch).await;
            batch = rest;
        }
    }

    async fn flush(&self, batch: &mut Vec<Pending>) {
        let pending = std::mem::take(batch);
        let outcome = self.push(&pending).await;
        debug!("Pushed {} record(s): {}", pending.len(), outcome);

        if !outcome.is_delivered() {
            self.observer.on_failure(&DeliveryFailure {
                outcome: outcome.clone(),
                records: pending.len(),
                endpoint: self.push_url.to_string(),
            });
        }
        for p in pending {
            // The caller may have given up waiting.
            let _ = p.reply.send(outcome.clone());
        }
    }

    async fn push(&self, pending: &[Pending]) -> DeliveryOutcome {
        let body = PushRequest::from_records(pending.iter().map(|p| &p.record));
        let result = self
            .http
            .post(self.push_url.clone())
            .json(&body)
            .send()
            .await;
        classify_response(result).await
    }
}

#[derive(Debug, Serialize)]
pub struct PushRequest<'a> {
    pub streams: Vec<PushStream<'a>>,
}

#[derive(Debug, Serialize)]
pub struct PushStream<'a> {
    pub stream: &'a BTreeMap<String, String>,
    /// `[unix epoch nanoseconds, line]` pairs.
    pub values: Vec<[String; 2]>,
}

impl<'a> PushRequest<'a> {
    /// Group records sharing a label set into one stream, keeping arrival order.
    pub fn from_records(records: impl IntoIterator<Item = &'a LogRecord>) -> Self {
        let mut streams: BTreeMap<&'a BTreeMap<String, String>, Vec<[String; 2]>> =
            BTreeMap::new();
        for record in records {
            let nanos = record.timestamp().timestamp_nanos_opt().unwrap_or_default();
            streams
                .entry(record.labels())
                .or_default()
                .push([nanos.to_string(), record.payload().to_string()]);
        }
        PushRequest {
            streams: streams
                .into_iter()
                .map(|(stream, values)| PushStream { stream, values })
                .collect(),
        }
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is not.
pub fn classify_status(status: StatusCode, detail: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Delivered;
    }
    let reason = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail.trim())
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryOutcome::TransientFailure(reason)
    } else {
        DeliveryOutcome::PermanentFailure(reason)
    }
}

async fn classify_response(result: Result<Response, reqwest::Error>) -> DeliveryOutcome {
    match result {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                return DeliveryOutcome::Delivered;
            }
            let detail = response.text().await.unwrap_or_default();
            classify_status(status, &detail)
        }
        // Building the request failed, e.g. the body did not serialize.
        Err(e) if e.is_builder() => DeliveryOutcome::PermanentFailure(e.to_string()),
        Err(e) => DeliveryOutcome::TransientFailure(e.to_string()),
    }
}
