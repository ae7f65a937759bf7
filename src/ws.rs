use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

pub const DEVICE_STATUS_EVENT: &str = "device.status";
pub const MESSAGE_STATUS_EVENT: &str = "message.status";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    /// Owner of the device or message; events never cross accounts.
    #[serde(skip)]
    pub account_id: String,
    pub payload: serde_json::Value,
}

impl WsEvent {
    pub fn new(event: &str, account_id: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            account_id: account_id.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "subscribe")]
    Subscribe { events: Option<Vec<String>> },
    #[serde(rename = "ping")]
    Ping,
}

/// Decides whether `evt` goes to a socket owned by `account_id`.
pub fn should_forward(
    evt: &WsEvent,
    account_id: &str,
    subscriptions: Option<&HashSet<String>>,
) -> bool {
    if evt.account_id != account_id {
        return false;
    }
    match subscriptions {
        Some(subs) => subs.contains(&evt.event),
        None => true,
    }
}

pub async fn handle_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<WsEvent>,
    account_id: String,
) {
    let mut subscriptions: Option<HashSet<String>> = None;

    let hello = WsEvent::new(
        "presence",
        &account_id,
        serde_json::json!({"status": "connected"}),
    );
    if socket
        .send(Message::Text(serde_json::to_string(&hello).unwrap_or_default()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else {
                    break;
                };
                match msg {
                    Message::Close(_) => break,
                    Message::Text(text) => match serde_json::from_str::<WsCommand>(&text) {
                        Ok(WsCommand::Subscribe { events }) => {
                            subscriptions = events.map(|items| items.into_iter().collect());
                        }
                        Ok(WsCommand::Ping) => {
                            let health = WsEvent::new("health", &account_id, serde_json::json!({"status": "ok"}));
                            let _ = socket.send(Message::Text(serde_json::to_string(&health).unwrap_or_default())).await;
                        }
                        Err(err) => tracing::debug!("ignoring websocket command: {err}"),
                    },
                    _ => {}
                }
            }
            evt = rx.recv() => {
                match evt {
                    Ok(evt) => {
                        if !should_forward(&evt, &account_id, subscriptions.as_ref()) {
                            continue;
                        }
                        let text = serde_json::to_string(&evt).unwrap_or_default();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(account_id = %account_id, skipped, "websocket client lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
