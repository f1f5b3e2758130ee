//! Coordinator HTTP surface: the `/health` endpoint and the `/ws` control
//! channel upgrade. Each accepted socket becomes one connection context; a
//! writer task drains the connection's outbox while the read loop feeds
//! frames into the coordinator's dispatcher.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::events::Envelope;

use super::service::{ConnectionCtx, Coordinator};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    nodes: usize,
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws))
        .layer(Extension(coordinator))
}

/// Binds the listener and serves until the process exits.
pub async fn serve(coordinator: Arc<Coordinator>, port: u16) -> anyhow::Result<()> {
    let app = router(coordinator);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Coordinator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        nodes: coordinator.node_count().await,
    })
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_socket(coordinator, socket))
}

async fn run_socket(coordinator: Arc<Coordinator>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();
    let conn = ConnectionCtx::new(outbox_tx);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbox_rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize outbound frame: {}", e);
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => coordinator.handle_envelope(&conn, envelope).await,
                Err(e) => {
                    tracing::warn!("Dropping unparsable frame: {}", e);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Socket error: {}", e);
                break;
            }
        }
    }

    if let Some(node_id) = conn.bound_node() {
        coordinator.handle_disconnect(node_id).await;
    }
    writer.abort();
}
