use crate::utils::{from_utc, to_utc};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether this replica may start new deliveries.
pub trait LeaderGate: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Used when leader election is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysActive;

impl LeaderGate for AlwaysActive {
    fn is_active(&self) -> bool {
        true
    }
}

/// Gate following a leadership flag published by an elector.
#[derive(Debug, Clone)]
pub struct WatchGate {
    rx: watch::Receiver<bool>,
}

impl WatchGate {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once leadership is held; false if the elector went away first.
    pub async fn wait_active(&mut self) -> bool {
        self.rx.wait_for(|active| *active).await.is_ok()
    }
}

impl LeaderGate for WatchGate {
    fn is_active(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("leadership lost: lease {0} is no longer held by this replica")]
    Lost(String),
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseSettings {
    pub fn new(name: String, namespace: String, identity: String) -> Self {
        Self {
            name,
            namespace,
            identity,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// What a replica should do with a Lease it just read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Held by us: renew.
    Renew,
    /// Free or expired: take over.
    Acquire,
    /// Held by someone else and still valid.
    Standby(String),
}

/// Decide what to do from the lease spec alone.
pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(spec) = spec else {
        return LeaseDecision::Acquire;
    };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseDecision::Acquire;
    }
    if holder == identity {
        return LeaseDecision::Renew;
    }
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    let renewed = spec
        .renew_time
        .as_ref()
        .and_then(to_utc)
        .or_else(|| spec.acquire_time.as_ref().and_then(to_utc));
    match renewed {
        Some(renewed) if renewed + duration > now => LeaseDecision::Standby(holder.to_string()),
        _ => LeaseDecision::Acquire,
    }
}

/// coordination.k8s.io/v1 Lease based leader election.
pub struct LeaseElector {
    api: Api<Lease>,
    settings: LeaseSettings,
    active: watch::Sender<bool>,
}

impl LeaseElector {
    pub fn new(client: Client, settings: LeaseSettings) -> Self {
        let api = Api::namespaced(client, &settings.namespace);
        let (active, _) = watch::channel(false);
        Self {
            api,
            settings,
            active,
        }
    }

    pub fn gate(&self) -> WatchGate {
        WatchGate::new(self.active.subscribe())
    }

    /// Campaign and renew until cancelled. Returns an error once held leadership is lost.
    pub async fn run(self, token: CancellationToken) -> Result<(), LeaderError> {
        let mut ticker = tokio::time::interval(self.settings.retry_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_renewed: Option<Instant> = None;

        info!(
            "Campaigning for lease {}/{} as {}",
            self.settings.namespace, self.settings.name, self.settings.identity
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if last_renewed.is_some() {
                        self.release().await;
                    }
                    self.active.send_replace(false);
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if last_renewed.is_none() {
                        info!("Acquired lease {}", self.settings.name);
                    }
                    last_renewed = Some(Instant::now());
                    self.active.send_replace(true);
                }
                Ok(false) => {
                    if last_renewed.is_some() {
                        return Err(self.lose());
                    }
                }
                Err(e) => {
                    warn!("Failed to update lease {}: {}", self.settings.name, e);
                    if let Some(renewed) = last_renewed
                        && renewed.elapsed() >= self.settings.renew_deadline
                    {
                        return Err(self.lose());
                    }
                }
            }
        }
    }

    fn lose(&self) -> LeaderError {
        self.active.send_replace(false);
        LeaderError::Lost(self.settings.name.clone())
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let Some(mut lease) = self.api.get_opt(&self.settings.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.settings.name.clone()),
                    namespace: Some(self.settings.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.held_spec(now, now, 0)),
            };
            return conflict_is_false(self.api.create(&PostParams::default(), &lease).await);
        };

        let spec = match decide(lease.spec.as_ref(), &self.settings.identity, now) {
            LeaseDecision::Standby(holder) => {
                debug!("Lease {} held by {}", self.settings.name, holder);
                return Ok(false);
            }
            LeaseDecision::Renew => {
                let current = lease.spec.as_ref();
                let acquired = current
                    .and_then(|s| s.acquire_time.as_ref())
                    .and_then(to_utc)
                    .unwrap_or(now);
                let transitions = current.and_then(|s| s.lease_transitions).unwrap_or(0);
                self.held_spec(acquired, now, transitions)
            }
            LeaseDecision::Acquire => {
                let transitions = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0);
                self.held_spec(now, now, transitions + 1)
            }
        };
        lease.spec = Some(spec);

        // metadata.resourceVersion makes the replace conditional.
        conflict_is_false(
            self.api
                .replace(&self.settings.name, &PostParams::default(), &lease)
                .await,
        )
    }

    async fn release(&self) {
        match self.try_release().await {
            Ok(true) => info!("Released lease {}", self.settings.name),
            Ok(false) => {}
            Err(e) => warn!("Failed to release lease {}: {}", self.settings.name, e),
        }
    }

    async fn try_release(&self) -> Result<bool, kube::Error> {
        let Some(mut lease) = self.api.get_opt(&self.settings.name).await? else {
            return Ok(false);
        };
        if decide(lease.spec.as_ref(), &self.settings.identity, Utc::now()) != LeaseDecision::Renew {
            return Ok(false);
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.lease_duration_seconds = Some(1);
        }
        conflict_is_false(
            self.api
                .replace(&self.settings.name, &PostParams::default(), &lease)
                .await,
        )
    }

    fn held_spec(&self, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.settings.identity.clone()),
            lease_duration_seconds: Some(self.settings.lease_duration.as_secs() as i32),
            acquire_time: from_utc(acquired),
            renew_time: from_utc(renewed),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

fn conflict_is_false(result: Result<Lease, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}

/// `HOSTNAME_pid`, unique per process within a pod.
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{}_{}", host, std::process::id())
}
