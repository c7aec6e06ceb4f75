//! WebSocket route handler
//!
//! Upgrades `/ws` requests and hands the socket to the lifecycle manager,
//! translating between axum and tungstenite message types.

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tracing::{debug, info, warn};

use crate::AppState;

/// Create WebSocket routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket upgrade request received");
    ws.on_failed_upgrade(|e| warn!("[WS] Upgrade failed: {}", e))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();

    let writer = sender.with(|msg: tungstenite::Message| future::ready(to_axum(msg)));
    let reader = receiver.map(|result| result.map(from_axum));

    let reason = state.lifecycle.handle_connection(writer, reader).await;
    debug!("[WS] Connection finished: {:?}", reason);
}

fn to_axum(msg: tungstenite::Message) -> Result<Message, axum::Error> {
    Ok(match msg {
        tungstenite::Message::Text(text) => Message::Text(text.to_string().into()),
        tungstenite::Message::Binary(data) => Message::Binary(Bytes::from(data.to_vec())),
        tungstenite::Message::Ping(data) => Message::Ping(Bytes::from(data.to_vec())),
        tungstenite::Message::Pong(data) => Message::Pong(Bytes::from(data.to_vec())),
        tungstenite::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.to_string().into(),
        })),
        tungstenite::Message::Frame(_) => {
            return Err(axum::Error::new("raw frames cannot be sent on an axum socket"))
        }
    })
}

fn from_axum(msg: Message) -> tungstenite::Message {
    match msg {
        Message::Text(text) => tungstenite::Message::Text(text.to_string().into()),
        Message::Binary(data) => tungstenite::Message::Binary(data.to_vec().into()),
        Message::Ping(data) => tungstenite::Message::Ping(data.to_vec().into()),
        Message::Pong(data) => tungstenite::Message::Pong(data.to_vec().into()),
        Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|f| tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.to_string().into(),
            }))
        }
    }
}
