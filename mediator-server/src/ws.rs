//! WebSocket relay (§4.10): on connect, push `init`; then forward queue and
//! rule events for the lifetime of the socket, and apply any
//! approve/deny the client sends through the same shared logic the REST
//! handlers use.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use mediator_protocol::WsClientMessage;
use mediator_protocol::WsMessage;
use mediator_queue::QueueEvent;

use crate::routes::approve_request;
use crate::routes::deny_request;
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let init = WsMessage::Init {
        pending: state.queue.pending(),
        config: state.config.get(),
        rules: state.config.rules(),
    };
    if send(&mut socket, &init).await.is_err() {
        return;
    }

    let mut queue_events = state.queue.subscribe();
    let mut rule_events = state.rules_tx.subscribe();
    let mut shutdown_events = state.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            event = queue_events.recv() => {
                let Ok(event) = event else { continue };
                let msg = match event {
                    QueueEvent::Request(req) => WsMessage::Request(req),
                    QueueEvent::Resolve(req) => WsMessage::Resolve(req),
                };
                // Best-effort: a send failure does not unregister the
                // socket, only the `recv() -> None/Err` branch below does.
                let _ = send(&mut socket, &msg).await;
            }
            rules = rule_events.recv() => {
                let Ok(rules) = rules else { continue };
                let _ = send(&mut socket, &WsMessage::Rules(rules)).await;
            }
            reason = shutdown_events.recv() => {
                if let Ok(reason) = reason {
                    let _ = send(&mut socket, &WsMessage::Shutdown { reason }).await;
                }
                return;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, &text).await,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

async fn handle_client_message(state: &Arc<AppState>, text: &str) {
    let Ok(msg) = serde_json::from_str::<WsClientMessage>(text) else {
        return;
    };
    match msg {
        WsClientMessage::Approve { id, always_allow } => {
            let _ = approve_request(state, &id, Some(mediator_protocol::ResolvedBy::Web), always_allow).await;
        }
        WsClientMessage::Deny { id, always_deny } => {
            let _ = deny_request(state, &id, Some(mediator_protocol::ResolvedBy::Web), always_deny).await;
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &WsMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}
