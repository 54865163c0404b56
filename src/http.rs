use crate::error::{DeliveryError, DeliveryFailure};
use crate::metrics::Metrics;
use crate::registry::ConsumerRegistry;
use crate::snapshot::encode_snapshot;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("failed to bind HTTP server on {listen}: {source}")]
pub struct BindError {
    pub listen: String,
    #[source]
    pub source: std::io::Error,
}

pub async fn bind(listen: &str) -> Result<TcpListener, BindError> {
    TcpListener::bind(listen).await.map_err(|source| BindError {
        listen: listen.to_string(),
        source,
    })
}

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub registry: ConsumerRegistry,
    pub send_timeout: Duration,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    registry: ConsumerRegistry,
    send_timeout: Duration,
) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .with_state(HttpAppState {
            metrics,
            registry,
            send_timeout,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    match state.registry.latest() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no snapshot yet").into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    peer: Option<ConnectInfo<SocketAddr>>,
    State(state): State<HttpAppState>,
) -> Response {
    let peer = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    ws.on_upgrade(move |socket| serve_consumer(socket, peer, state))
}

/// Streams snapshots to one client until it leaves, fails a send or the registry closes.
async fn serve_consumer(mut socket: WebSocket, peer: String, state: HttpAppState) {
    let registry = state.registry;
    let (id, mut queue) = registry.attach(peer);

    loop {
        tokio::select! {
            next = queue.next() => {
                let Some(snapshot) = next else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let text = match encode_snapshot(&snapshot) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(consumer = %id, error = %err, "failed to encode snapshot");
                        continue;
                    }
                };
                match deliver(socket.send(Message::Text(text)), state.send_timeout).await {
                    Ok(()) => state.metrics.inc_message_sent(),
                    Err(kind) => {
                        registry.report_failure(&DeliveryError { consumer: id, kind });
                        break;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    registry.detach(id);
                    break;
                }
                Some(Err(err)) => {
                    debug!(consumer = %id, error = %err, "websocket receive failed");
                    registry.report_failure(&DeliveryError {
                        consumer: id,
                        kind: DeliveryFailure::Transport,
                    });
                    break;
                }
                // Clients are not expected to talk; pings are answered by axum.
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Awaits one socket send, bounded by `timeout`.
async fn deliver<F, E>(send: F, timeout: Duration) -> Result<(), DeliveryFailure>
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "websocket send failed");
            Err(DeliveryFailure::Transport)
        }
        Err(_elapsed) => Err(DeliveryFailure::Timeout),
    }
}
