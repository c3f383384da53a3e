// =============================================================================
// WebSocket Handler — Push-based active view updates
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. The current ActiveView immediately on connect (the replayed window).
//   2. A fresh ActiveView every time the router publishes a change: a new
//      tick, a health transition, or a key switch.
//
// Ping frames are answered with Pong; a Close frame or send failure ends the
// connection.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::market_data::ActiveView;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
///
/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut views = state.router.active_view();

    // Replay first.
    let initial = views.borrow_and_update().clone();
    if let Err(e) = send_view(&mut sender, &initial).await {
        warn!(error = %e, "failed to send initial active view");
        return;
    }

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    info!("subscription router stopped, closing WebSocket");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Err(e) = send_view(&mut sender, &view).await {
                    debug!(error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Serialize and send one view.
async fn send_view<S>(sender: &mut S, view: &ActiveView) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(view) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = view.version, ticks = view.ticks.len(), "active view sent");
            Ok(())
        }
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "failed to serialize active view");
            Ok(())
        }
    }
}
