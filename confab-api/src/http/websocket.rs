//! WebSocket handler with JSON text transmission
//!
//! This handler only adapts the socket to the `StreamMessage` trait; request
//! handling, ordering and cleanup are done by `ConnectionHandler::run()`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use confab_sfu::UserId;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{AppError, AppState};
use crate::signaling::{ConnectionHandler, ServerMessage, StreamMessage};

/// How long the writer may keep flushing after the reader loop ended
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Application-level identity, used for publish authorization
    pub user_id: Option<String>,
}

/// WebSocket stream implementation of `StreamMessage` trait
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl StreamMessage for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    // Non UTF-8 payloads surface as a malformed message
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                Some(Ok(_)) => {
                    // Ignore ping/pong and continue loop
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// WebSocket handler for signaling connections
///
/// <ws://host/ws?userId={user_id}>
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let user_id = match query.user_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::bad_request("userId must not be empty"));
        }
        Some(id) => Some(UserId::from(id)),
        None => None,
    };

    let max_message_bytes = state.websocket.max_message_bytes;
    Ok(ws
        .max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    // Bounded queue: messages to a client that cannot keep up are dropped
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.websocket.outbound_queue_size);
    let client_id = state.signaling.connect(user_id, tx);
    info!(client_id = %client_id, "WebSocket connection established");

    let (mut sink, receiver) = socket.split();
    let is_alive = Arc::new(AtomicBool::new(true));

    // Server messages -> WebSocket
    let writer_alive = Arc::clone(&is_alive);
    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(client_id = %writer_client, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(client_id = %writer_client, error = %e, "Failed to send WebSocket message");
                writer_alive.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let handler = ConnectionHandler::new(
        Arc::clone(&state.signaling),
        client_id.clone(),
        state.websocket.keepalive,
    );
    let mut stream = WebSocketStream { receiver, is_alive };
    handler.run(&mut stream).await;

    // The registry dropped the queue sender on disconnect; let the writer flush
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    info!(client_id = %client_id, "WebSocket connection closed");
}
