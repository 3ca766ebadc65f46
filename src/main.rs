mod cli;
mod config;
mod dedup;
mod encoder;
mod kubernetes;
mod labels;
mod leader;
mod probes;
mod reconciler;
mod retry;
mod sink;
mod stats;
mod types;
mod utils;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::Cli;
use config::Config;
use dedup::DedupGuard;
use kubernetes::{ApiEventSource, StoreEventSource};
use labels::LabelEnricher;
use leader::{AlwaysActive, LeaderGate, LeaseElector, LeaseSettings};
use probes::Endpoint;
use reconciler::{EventReconciler, EventSource};
use sink::{LokiClient, LoggingObserver};
use stats::ForwardingStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Nothing is started with a half-usable configuration.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: cannot load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_string())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    run(config, token).await
}

async fn run(config: Config, token: CancellationToken) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("unable to create Kubernetes client")?;
    let stats = Arc::new(ForwardingStats::default());
    let dedup = Arc::new(DedupGuard::new(config.dedup_capacity, config.dedup_ttl));

    if let Some(addr) = config.probe_addr {
        let listener = probes::bind(addr)
            .await
            .with_context(|| format!("unable to set up health checks on {}", addr))?;
        tokio::spawn(probes::serve(listener, Endpoint::Probes, token.clone()));
    }
    if let Some(addr) = config.metrics_addr {
        let listener = probes::bind(addr)
            .await
            .with_context(|| format!("unable to serve metrics on {}", addr))?;
        let endpoint = Endpoint::Metrics {
            stats: stats.clone(),
            dedup: dedup.clone(),
        };
        tokio::spawn(probes::serve(listener, endpoint, token.clone()));
    }

    let observer = Arc::new(LoggingObserver::new(stats.clone()));
    let loki = Arc::new(
        LokiClient::new(config.client.clone(), observer).context("unable to start push client")?,
    );
    info!("Starting push client for {}", loki.endpoint());

    let mut elector = None;
    let gate: Arc<dyn LeaderGate> = if config.leader_elect {
        let namespace = config
            .leader_election_namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        let settings = LeaseSettings::new(
            config.leader_election_id.clone(),
            namespace,
            leader::default_identity(),
        );
        let lease_elector = LeaseElector::new(client.clone(), settings);
        let mut gate = lease_elector.gate();

        let elector_token = token.clone();
        elector = Some(tokio::spawn(async move {
            let result = lease_elector.run(elector_token.clone()).await;
            if result.is_err() {
                elector_token.cancel();
            }
            result
        }));

        info!("Waiting to acquire leadership");
        tokio::select! {
            _ = token.cancelled() => {}
            _ = gate.wait_active() => {}
        }
        Arc::new(gate)
    } else {
        Arc::new(AlwaysActive)
    };

    if !token.is_cancelled() {
        let api = kubernetes::events_api(client.clone(), config.watch_namespace.as_deref());
        let controller = kubernetes::event_controller(api, config.max_concurrent_reconciles);
        let source: Arc<dyn EventSource> = if config.direct_reads {
            Arc::new(ApiEventSource::new(client.clone()))
        } else {
            Arc::new(StoreEventSource::new(controller.store()))
        };
        let enricher = LabelEnricher::new(
            Arc::new(config.common_labels.clone()),
            config.label_precedence,
        );
        let reconciler = Arc::new(EventReconciler::new(
            source,
            loki.clone(),
            gate,
            dedup.clone(),
            enricher,
            config.retry,
            stats.clone(),
        ));
        kubernetes::run(controller, reconciler, config.shutdown_grace, token.clone()).await;
    }

    token.cancel();
    loki.close(config.shutdown_grace).await;

    if let Some(handle) = elector {
        handle
            .await
            .context("leader election task failed")?
            .context("problem running leader election")?;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    token.cancel();
}
