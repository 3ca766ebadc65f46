use crate::reconciler::{EventReconciler, EventSource, ReconcileError, ReconcileOutcome, SourceError};
use crate::types::{ClusterEvent, EventType, InvolvedObject, ObjectKey};
use crate::utils::to_utc;
use async_trait::async_trait;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl From<&Event> for ClusterEvent {
    fn from(event: &Event) -> Self {
        let involved = &event.involved_object;
        let series = event.series.as_ref();
        let event_time = event.event_time.as_ref().and_then(to_utc);

        ClusterEvent {
            namespace: event.metadata.namespace.clone().unwrap_or_default(),
            name: event.metadata.name.clone().unwrap_or_default(),
            uid: event.metadata.uid.clone().unwrap_or_default(),
            resource_version: event.metadata.resource_version.clone().unwrap_or_default(),
            involved_object: InvolvedObject {
                kind: involved.kind.clone().unwrap_or_default(),
                namespace: involved.namespace.clone().unwrap_or_default(),
                name: involved.name.clone().unwrap_or_default(),
                uid: involved.uid.clone().unwrap_or_default(),
            },
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            event_type: match event.type_.as_deref() {
                Some("Warning") => EventType::Warning,
                _ => EventType::Normal,
            },
            first_seen: event.first_timestamp.as_ref().and_then(to_utc).or(event_time),
            last_seen: event
                .last_timestamp
                .as_ref()
                .and_then(to_utc)
                .or_else(|| {
                    series
                        .and_then(|s| s.last_observed_time.as_ref())
                        .and_then(to_utc)
                })
                .or(event_time),
            count: event
                .count
                .or_else(|| series.and_then(|s| s.count))
                .unwrap_or(1),
            source: event
                .source
                .as_ref()
                .and_then(|s| s.component.clone())
                .or_else(|| event.reporting_component.clone())
                .unwrap_or_default(),
            host: event.source.as_ref().and_then(|s| s.host.clone()),
        }
    }
}

pub fn object_key(event: &Event) -> ObjectKey {
    ObjectKey::new(event.namespace().unwrap_or_default(), event.name_any())
}

/// Reads events from the controller's informer cache.
pub struct StoreEventSource {
    store: Store<Event>,
}

impl StoreEventSource {
    pub fn new(store: Store<Event>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSource for StoreEventSource {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterEvent>, SourceError> {
        let obj_ref = ObjectRef::<Event>::new(&key.name).within(&key.namespace);
        Ok(self
            .store
            .get(&obj_ref)
            .map(|event| ClusterEvent::from(event.as_ref())))
    }
}

/// Reads events straight from the API server.
pub struct ApiEventSource {
    client: Client,
}

impl ApiEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for ApiEventSource {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterEvent>, SourceError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name)
            .await
            .map(|event| event.as_ref().map(ClusterEvent::from))
            .map_err(|e| SourceError {
                key: key.clone(),
                message: e.to_string(),
            })
    }
}

pub fn events_api(client: Client, namespace: Option<&str>) -> Api<Event> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Controller over core/v1 Events. Its queue serializes work per object,
/// coalesces repeated notifications and schedules requeues.
pub fn event_controller(api: Api<Event>, concurrency: u16) -> Controller<Event> {
    Controller::new(api, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
}

async fn reconcile(event: Arc<Event>, ctx: Arc<EventReconciler>) -> Result<Action, ReconcileError> {
    let key = object_key(&event);
    Ok(match ctx.reconcile(&key).await? {
        ReconcileOutcome::Success => Action::await_change(),
        ReconcileOutcome::Requeue(after) => Action::requeue(after),
    })
}

fn error_policy(event: Arc<Event>, error: &ReconcileError, ctx: Arc<EventReconciler>) -> Action {
    ctx.stats().record_reconcile_error();
    let key = object_key(&event);
    match error {
        ReconcileError::Source(e) => {
            warn!("[{}] {}", key, e);
            Action::requeue(ctx.retry_policy().base)
        }
        // Retrying cannot help until the object itself changes.
        ReconcileError::Encode(e) => {
            error!("[{}] {}", key, e);
            Action::await_change()
        }
    }
}

/// Drive the controller until `token` is cancelled, then give in-flight
/// reconciles up to `grace` to finish.
pub async fn run(
    controller: Controller<Event>,
    reconciler: Arc<EventReconciler>,
    grace: Duration,
    token: CancellationToken,
) {
    info!("Starting event controller");
    let forwarding = controller
        .graceful_shutdown_on(token.clone().cancelled_owned())
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("Reconciled {}", obj),
                Err(e) => warn!("Reconcile failed: {}", e),
            }
        });

    let deadline = async {
        token.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        _ = forwarding => info!("Event controller stopped"),
        _ = deadline => warn!("In-flight reconciles did not finish within {:?}", grace),
    }
}
