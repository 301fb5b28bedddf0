//! Terminal socket: bridges one WebSocket to one process session's watcher
//! queue.

use std::sync::Arc;

use agentrix_protocol::{ClientMessage, ServerMessage};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use libagentrix::ProcessSession;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;

type SocketTx = SplitSink<WebSocket, Message>;
type SocketRx = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketQuery {
    pub session_id: Option<String>,
}

/// `GET /api/terminal/socket?sessionId=<id>`. The session credential is
/// checked by the router middleware before the upgrade.
pub async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = bridge(socket, state, query.session_id).await {
            warn!(error = %e, "terminal socket closed with error");
        }
    })
}

async fn bridge(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session = match &session_id {
        Some(id) => state.registry.get(id).await,
        None => None,
    };
    let Some(session) = session else {
        let message = match session_id {
            Some(id) => format!("session not found: {id}"),
            None => "sessionId is required".to_string(),
        };
        send(&mut ws_tx, &ServerMessage::Error { message }).await?;
        let _ = ws_tx.send(Message::Close(None)).await;
        return Ok(());
    };

    let mut attachment = session.attach().await;
    let outcome = pump(&session, &mut attachment.rx, &mut ws_tx, &mut ws_rx).await;
    if let Some(watcher_id) = attachment.watcher_id {
        session.detach(watcher_id).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
    outcome
}

async fn pump(
    session: &ProcessSession,
    outgoing: &mut mpsc::Receiver<ServerMessage>,
    ws_tx: &mut SocketTx,
    ws_rx: &mut SocketRx,
) -> Result<()> {
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                // The broker drops the queue when the session closes or
                // this watcher falls behind.
                let Some(message) = message else {
                    return Ok(());
                };
                let exit = message.is_exit();
                send(ws_tx, &message).await?;
                if exit {
                    return Ok(());
                }
            }
            frame = ws_rx.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match frame? {
                    Message::Text(text) => handle_text(session, text.as_str()).await,
                    Message::Binary(bytes) => write_input(session, &String::from_utf8_lossy(&bytes)).await,
                    Message::Ping(payload) => ws_tx.send(Message::Pong(payload)).await?,
                    Message::Pong(_) => {}
                    Message::Close(_) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_text(session: &ProcessSession, text: &str) {
    match ClientMessage::parse(text) {
        ClientMessage::Input(data) => write_input(session, &data).await,
        ClientMessage::Resize { cols, rows } => {
            if let Err(e) = session.resize(cols, rows).await {
                warn!(session_id = %session.id(), cols, rows, error = %e, "resize failed");
            } else if session.using_tmux() {
                // tmux repaints on resize; replay so clients redraw from a
                // clean slate.
                session.refresh().await;
            }
        }
        ClientMessage::Raw(data) => {
            debug!(session_id = %session.id(), len = data.len(), "non-envelope frame written as raw input");
            write_input(session, &data).await;
        }
    }
}

async fn write_input(session: &ProcessSession, data: &str) {
    if let Err(e) = session.write(data).await {
        debug!(session_id = %session.id(), error = %e, "input dropped");
    }
}

async fn send(ws_tx: &mut SocketTx, message: &ServerMessage) -> Result<()> {
    ws_tx
        .send(Message::Text(serde_json::to_string(message)?.into()))
        .await?;
    Ok(())
}
