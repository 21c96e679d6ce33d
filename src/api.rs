// =============================================================================
// API surface — WebSocket binding for the broadcast fabric
// =============================================================================
//
// Clients connect to /ws, receive a HANDSHAKE, and drive the session with
// SUBSCRIBE / UNSUBSCRIBE / RESYNC / PING messages. /healthz answers liveness
// probes. Dashboards and auth live elsewhere; this surface only speaks the
// fabric protocol.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::fabric::BroadcastFabric;

/// Build the router.
pub fn router(fabric: Arc<BroadcastFabric>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(fabric)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(fabric): State<Arc<BroadcastFabric>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, fabric))
}

/// One subscriber session: outbound fabric queue -> socket, inbound socket
/// frames -> fabric. Either side ending tears the session down.
async fn handle_connection(socket: WebSocket, fabric: Arc<BroadcastFabric>) {
    let (session_id, mut outbound) = fabric.accept();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "serialisation failed");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(session_id = %session_id, error = %e, "socket send failed");
                            break;
                        }
                    }
                    // The fabric evicted us.
                    None => break,
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        fabric.handle_client_text(&session_id, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(session_id = %session_id, "close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session_id = %session_id, "binary frame ignored");
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "socket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    fabric.disconnect(&session_id);
}
