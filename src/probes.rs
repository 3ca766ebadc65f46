use crate::dedup::DedupGuard;
use crate::stats::ForwardingStats;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a listener serves.
#[derive(Clone)]
pub enum Endpoint {
    /// `/healthz` and `/readyz`; plain pings that do not look at forwarding state.
    Probes,
    /// `/metrics` in Prometheus text format.
    Metrics {
        stats: Arc<ForwardingStats>,
        dedup: Arc<DedupGuard>,
    },
}

impl Endpoint {
    fn name(&self) -> &'static str {
        match self {
            Endpoint::Probes => "health probes",
            Endpoint::Metrics { .. } => "metrics",
        }
    }
}

pub fn respond(endpoint: &Endpoint, path: &str) -> Response<Full<Bytes>> {
    match (endpoint, path) {
        (Endpoint::Probes, "/healthz" | "/readyz") => text(StatusCode::OK, "ok".to_string()),
        (Endpoint::Metrics { stats, dedup }, "/metrics") => text(StatusCode::OK, stats.render(dedup.len())),
        _ => text(StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    response
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve `endpoint` on `listener` until `token` is cancelled.
pub async fn serve(listener: TcpListener, endpoint: Endpoint, token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("Serving {} on {}", endpoint.name(), addr);
    }
    let server = http1::Builder::new();

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Failed to accept {} connection: {}", endpoint.name(), e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let server = server.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = respond(&endpoint, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = server.serve_connection(io, service).await {
                debug!("Probe connection error: {}", e);
            }
        });
    }
}
