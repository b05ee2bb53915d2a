//! WebSocket connection handler.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use aion_events::AppEvent;

use crate::GatewayState;
use crate::handlers::handle_rpc;
use crate::jsonrpc::{INVALID_REQUEST, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

/// Serve one client: answer its requests and push every published event.
pub async fn handle_ws_connection(socket: WebSocket, state: Arc<GatewayState>) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        let response = process_rpc_message(&text, &state).await;
                        let response_json = match serde_json::to_string(&response) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize response: {e}");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(response_json.into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Message::Ping(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client fell behind, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(json) = notification_json(&event) else {
                    continue;
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Serialize an event as a JSON-RPC notification named after the event.
fn notification_json(event: &AppEvent) -> Option<String> {
    let notification = JsonRpcNotification::new(event.name(), event.payload());
    match serde_json::to_string(&notification) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize {} notification: {e}", event.name());
            None
        }
    }
}

/// Parse and process a JSON-RPC message.
async fn process_rpc_message(text: &str, state: &GatewayState) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            return JsonRpcResponse::error(
                serde_json::Value::Null,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            request.id,
            INVALID_REQUEST,
            "Invalid JSON-RPC version, expected '2.0'",
        );
    }

    handle_rpc(&request.method, request.params, request.id, state).await
}
