use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{validate_document_id, ApiResult};
use crate::footnotes::types::ProgressSnapshot;
use crate::progress::ProgressHandle;
use crate::state::AppState;

/// Messages a client may send on the progress socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Get,
    Set { data: ProgressSnapshot },
}

/// Messages the server pushes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Progress { data: Option<ProgressSnapshot> },
    Error { message: String },
}

pub async fn progress_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Response> {
    validate_document_id(&document_id)?;
    let handle = state.progress.handle(&document_id);
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, handle)))
}

async fn serve_socket(mut socket: WebSocket, handle: ProgressHandle) {
    let mut updates = match handle.subscribe().await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(document_id = %handle.document_id(), error = %e, "progress subscribe failed");
            return;
        }
    };
    debug!(document_id = %handle.document_id(), "progress socket open");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(snapshot) = update else { break };
                if send(&mut socket, &ServerMessage::Progress { data: Some(snapshot) }).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                if let Some(reply) = client_command(&handle, &text).await {
                    if send(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(document_id = %handle.document_id(), "progress socket closed");
}

/// Handle one client message. A `set` needs no direct reply: the new
/// snapshot reaches this socket through its own subscription.
pub(crate) async fn client_command(handle: &ProgressHandle, text: &str) -> Option<ServerMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return Some(ServerMessage::Error {
                message: format!("unrecognised message: {}", e),
            })
        }
    };
    match message {
        ClientMessage::Get => Some(match handle.get().await {
            Ok(data) => ServerMessage::Progress { data },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        }),
        ClientMessage::Set { data } => match handle.set(data).await {
            Ok(_) => None,
            Err(e) => Some(ServerMessage::Error {
                message: e.to_string(),
            }),
        },
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "could not encode progress message");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}
