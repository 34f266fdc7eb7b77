//! WebSocket event channel
//!
//! The token is checked once, before the upgrade (see `server::require_token`).
//! After that every frame on the socket is trusted. Frames are relayed to all
//! other sessions without looking at the payload.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use nook_core::{BroadcastRelay, RelayEvent};
use tracing::{debug, info};

use crate::server::SharedState;

/// GET /ws
pub async fn upgrade(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| run_session(socket, relay))
}

async fn run_session(socket: WebSocket, relay: BroadcastRelay) {
    let mut session = relay.join();
    let id = session.id();
    info!(session = %id, peers = relay.session_count() - 1, "event channel connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayEvent>(&text) {
                    Ok(event) => {
                        let kind = event.kind();
                        let delivered = session.publish(event);
                        debug!(session = %id, kind, delivered, "relayed");
                    }
                    Err(e) => debug!(session = %id, error = %e, "ignoring malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "socket error");
                    break;
                }
            },
            outgoing = session.recv() => match outgoing {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(error = %e, "could not encode event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!(session = %id, "event channel closed");
}
