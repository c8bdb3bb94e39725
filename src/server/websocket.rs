//! WebSocket transport and HTTP surface
//!
//! `GET /ws` upgrades to the relay protocol, `GET /health` reports liveness,
//! and everything else is served from the static asset directory.

use crate::server::protocol::{ClientEvent, ProtocolError, ServerEvent, AUTH_FAILED_MESSAGE};
use crate::server::registry::OutboundMessage;
use crate::server::relay::RelayState;
use crate::server::session::Session;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, warn};

/// Create the HTTP router
pub fn create_router(state: RelayState, public_dir: &Path) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(public_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = state.accept();
    debug!(conn_id = %session.id(), "WebSocket connection accepted");

    // The first frame must be the auth handshake
    let first = match timeout(state.handshake_timeout, next_frame(&mut receiver)).await {
        Ok(frame) => frame,
        Err(_) => {
            debug!(conn_id = %session.id(), "Handshake timed out");
            session.terminate("handshake timeout");
            refuse(&mut sender).await;
            return;
        }
    };
    let token = match first {
        Some(Ok(Message::Text(text))) => handshake_token(ClientEvent::decode(text.as_str())),
        Some(Ok(Message::Binary(data))) => handshake_token(ClientEvent::from_slice(&data)),
        _ => {
            debug!(conn_id = %session.id(), "Connection closed before handshake");
            session.terminate("closed before handshake");
            return;
        }
    };

    let Some(token) = token else {
        session.terminate("missing handshake");
        refuse(&mut sender).await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(state.queue_capacity);

    // Keep reading while the token is verified: a client that leaves abandons
    // the verification, and frames sent meanwhile are replayed in order.
    let mut early = Vec::new();
    let verified = {
        let auth = session.authenticate(token.as_deref(), tx);
        tokio::pin!(auth);

        loop {
            tokio::select! {
                result = &mut auth => break Some(result),
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => early.push(ClientEvent::decode(text.as_str())),
                    Some(Ok(Message::Binary(data))) => early.push(ClientEvent::from_slice(&data)),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    _ => break None,
                },
            }
        }
    };

    match verified {
        Some(Ok(_)) => {}
        Some(Err(_)) => {
            refuse(&mut sender).await;
            return;
        }
        None => {
            debug!(conn_id = %session.id(), "Connection closed during verification");
            session.terminate("closed during verification");
            return;
        }
    }

    let conn_id = session.id();

    // Spawn task to forward queued events to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender
                .send(Message::Text(msg.payload.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    for frame in early {
        dispatch(&mut session, frame);
    }

    // Process incoming messages
    let reason = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => dispatch(&mut session, ClientEvent::decode(text.as_str())),
            Some(Ok(Message::Binary(data))) => dispatch(&mut session, ClientEvent::from_slice(&data)),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Handled automatically by axum
            }
            Some(Ok(Message::Close(_))) => break "client closed",
            Some(Err(e)) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                break "transport error";
            }
            None => break "stream ended",
        }
    };

    // Cleanup
    session.terminate(reason);
    send_task.abort();
}

/// Next frame that is not a ping or pong
async fn next_frame(
    receiver: &mut SplitStream<WebSocket>,
) -> Option<Result<Message, axum::Error>> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => return other,
        }
    }
}

/// Token from a handshake frame; `None` if the frame is not a handshake
fn handshake_token(frame: Result<ClientEvent, ProtocolError>) -> Option<Option<String>> {
    match frame {
        Ok(ClientEvent::Auth { token }) => Some(token),
        Ok(other) => {
            debug!(event = other.name(), "Must authenticate first");
            None
        }
        Err(e) => {
            debug!(error = %e, "Invalid handshake frame");
            None
        }
    }
}

fn dispatch(session: &mut Session, frame: Result<ClientEvent, ProtocolError>) {
    match frame {
        Ok(event) => session.handle(event),
        Err(e) => debug!(conn_id = %session.id(), error = %e, "Ignoring frame"),
    }
}

/// Refuse the handshake with a generic reason and close
async fn refuse(sender: &mut SplitSink<WebSocket, Message>) {
    match ServerEvent::auth_failed().to_json() {
        Ok(text) => {
            let _ = sender.send(Message::Text(text.into())).await;
        }
        Err(e) => warn!(error = %e, "Failed to encode auth:error"),
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(AUTH_FAILED_MESSAGE),
        })))
        .await;
}
