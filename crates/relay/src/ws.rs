//! WebSocket endpoint: upgrade, welcome, and per-role relay loops.

use crate::AppState;
use crate::pairing::CONN_QUEUE;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use p2prd_protocol::RelayMessage;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Operator,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Operator => "operator",
        }
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    role: String,
    #[serde(rename = "hostId")]
    host_id: Option<Uuid>,
}

/// GET /ws?role={host|operator}&hostId=<uuid>
///
/// The rate limit applies before the upgrade; a rejected request never
/// becomes a WebSocket.
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.limiter.check(addr.ip()) {
        warn!(ip = %addr.ip(), "Upgrade rate limited");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let role = match query.role.as_str() {
        "host" => Role::Host,
        "operator" => Role::Operator,
        other => {
            debug!(role = other, "Unknown role");
            return (StatusCode::BAD_REQUEST, "unknown role").into_response();
        }
    };
    if role == Role::Operator && query.host_id.is_none() {
        return (StatusCode::BAD_REQUEST, "hostId required for operators").into_response();
    }

    info!(ip = %addr.ip(), role = role.as_str(), "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(state, socket, role, query.host_id))
}

async fn handle_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    role: Role,
    query_host_id: Option<Uuid>,
) {
    let welcome = serde_json::to_string(&RelayMessage::Welcome {
        role: role.as_str().to_string(),
    })
    .expect("welcome serializes");
    if socket.send(Message::Text(welcome.into())).await.is_err() {
        return;
    }

    let registry = &state.pairing;
    let conn = registry.connection_id();
    let (tx, mut rx) = mpsc::channel::<String>(CONN_QUEUE);

    // Operators bind immediately from the query parameter; hosts identify
    // themselves with their first JSON message carrying `host_id`.
    let mut bound_host_id = match role {
        Role::Operator => {
            let host_id = query_host_id.expect("checked before upgrade");
            registry.register_operator(host_id, conn, tx.clone()).await;
            Some(host_id)
        }
        Role::Host => {
            if let Some(host_id) = query_host_id {
                registry.register_host(host_id, conn, tx.clone()).await;
                Some(host_id)
            } else {
                None
            }
        }
    };

    loop {
        tokio::select! {
            forwarded = rx.recv() => {
                let Some(text) = forwarded else { break };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.to_string();
                        match role {
                            Role::Host => {
                                if bound_host_id.is_none()
                                    && let Some(host_id) = extract_host_id(&text)
                                {
                                    registry.register_host(host_id, conn, tx.clone()).await;
                                    bound_host_id = Some(host_id);
                                }
                                match bound_host_id {
                                    Some(host_id) => {
                                        registry.to_operators(host_id, &text).await;
                                    }
                                    None => {
                                        debug!("Host message before identification, dropped");
                                    }
                                }
                            }
                            Role::Operator => {
                                let host_id = bound_host_id.expect("operator always bound");
                                registry.to_host(host_id, text).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(host_id) = bound_host_id {
        match role {
            Role::Host => registry.unregister_host(host_id, conn).await,
            Role::Operator => registry.unregister_operator(host_id, conn).await,
        }
    }
    info!(role = role.as_str(), "WebSocket disconnected");
}

/// Pull `host_id` out of an arbitrary JSON message, if present.
fn extract_host_id(text: &str) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("host_id")
        .and_then(|id| id.as_str())
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_extracted_from_host_hello() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"host_hello","host_id":"{id}","monitors":[],"active_monitor_id":"0"}}"#
        );
        assert_eq!(extract_host_id(&text), Some(id));
    }

    #[test]
    fn messages_without_host_id_do_not_identify() {
        assert_eq!(extract_host_id(r#"{"type":"ice_state","state":"connected"}"#), None);
        assert_eq!(extract_host_id(r#"{"host_id":"not-a-uuid"}"#), None);
        assert_eq!(extract_host_id("not json"), None);
    }
}
