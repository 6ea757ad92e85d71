//! Broadcast hub for observer attachments
//!
//! Every observer gets a fan-out of the engine's event stream plus a private
//! reply lane for register / cash-out / state / ping requests. Slow
//! observers are dropped rather than allowed to block the engine, and
//! attachments silent past the idle timeout are reaped.

use super::errors::error_code;
use super::handlers::AppState;
use crate::config::HubConfig;
use crate::engine::{CashoutReceipt, RoundEngine, RoundSnapshot};
use crate::ledger::Ledger;
use crate::types::Asset;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close code sent to observers on service shutdown
const CLOSE_GOING_AWAY: u16 = 1001;

/// Messages observers may send to the hub
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        player_id: String,
    },
    CashOut {
        #[serde(default)]
        player_id: Option<String>,
    },
    GetState,
    Ping,
}

/// Replies and notifications sent back to a single observer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        client_id: String,
    },
    Registered {
        player_id: String,
    },
    RegisterError {
        message: String,
    },
    CashoutOk {
        round_id: String,
        multiplier: f64,
        payout_fiat: f64,
        payout_asset: f64,
        asset: Asset,
    },
    CashoutErr {
        code: String,
        message: String,
    },
    State {
        active: bool,
        snapshot: Option<RoundSnapshot>,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    fn cashout_ok(receipt: CashoutReceipt) -> Self {
        ServerMessage::CashoutOk {
            round_id: receipt.round_id,
            multiplier: receipt.multiplier,
            payout_fiat: receipt.payout_fiat,
            payout_asset: receipt.payout_asset,
            asset: receipt.asset,
        }
    }
}

/// Hub owning the observer set
pub struct BroadcastHub {
    engine: Arc<RoundEngine>,
    ledger: Arc<Ledger>,
    config: HubConfig,
    client_count: AtomicU64,
    /// Observer id → registered player id
    registrations: DashMap<String, String>,
    shutdown: watch::Receiver<bool>,
}

impl BroadcastHub {
    pub fn new(
        engine: Arc<RoundEngine>,
        ledger: Arc<Ledger>,
        config: HubConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            ledger,
            config,
            client_count: AtomicU64::new(0),
            registrations: DashMap::new(),
            shutdown,
        }
    }

    pub fn connected_observers(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Player currently bound to an observer attachment, if any
    pub fn registered_player(&self, client_id: &str) -> Option<String> {
        self.registrations.get(client_id).map(|r| r.value().clone())
    }

    async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let client_id = Uuid::new_v4().to_string();
        let count = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(client = %client_id, total = count, "Observer attached");

        let (mut sender, mut receiver) = socket.split();
        let mut events = self.engine.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(self.config.observer_queue_bound);

        let last_seen = Arc::new(AtomicU64::new(now_secs()));

        let welcome = ServerMessage::Connected {
            client_id: client_id.clone(),
        };
        if send_json(&mut sender, &welcome).await.is_err() {
            self.finish_connection(&client_id);
            return;
        }

        // Inbound lane: parse observer requests and queue replies.
        let hub = self.clone();
        let recv_client = client_id.clone();
        let recv_seen = last_seen.clone();
        let receive_task = tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                recv_seen.store(now_secs(), Ordering::SeqCst);

                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        debug!(client = %recv_client, "Observer requested close");
                        break;
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => continue,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(client = %recv_client, "Observer socket error: {}", e);
                        break;
                    }
                };

                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => hub.handle_message(&recv_client, message).await,
                    Err(_) => ServerMessage::Error {
                        message: "Invalid message format".to_string(),
                    },
                };

                // A full reply queue means the observer stopped draining;
                // drop it rather than buffer without bound.
                if let Err(e) = reply_tx.try_send(reply) {
                    warn!(client = %recv_client, "Observer reply queue overflow: {}", e);
                    break;
                }
            }
        });

        // Outbound lane: engine events, replies, keep-alive.
        let keep_alive = Duration::from_secs(self.config.keep_alive_secs);
        let idle_timeout = self.config.idle_timeout_secs;
        let send_client = client_id.clone();
        let mut shutdown = self.shutdown.clone();
        let send_task = tokio::spawn(async move {
            let mut keep_alive_timer = tokio::time::interval(keep_alive);
            keep_alive_timer.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    reply = reply_rx.recv() => {
                        let Some(reply) = reply else { break };
                        if send_json(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => {
                                if send_json(&mut sender, &event).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                // An observer this far behind would only see a
                                // corrupted view of the round; cut it loose.
                                warn!(client = %send_client, lagged = n, "Dropping slow observer");
                                break;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = keep_alive_timer.tick() => {
                        let idle = now_secs().saturating_sub(last_seen.load(Ordering::SeqCst));
                        if idle > idle_timeout {
                            info!(client = %send_client, idle, "Reaping silent observer");
                            break;
                        }
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_GOING_AWAY,
                                reason: "Service shutting down".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let mut receive_task = receive_task;
        let mut send_task = send_task;
        tokio::select! {
            _ = &mut receive_task => send_task.abort(),
            _ = &mut send_task => receive_task.abort(),
        }

        self.finish_connection(&client_id);
    }

    async fn handle_message(&self, client_id: &str, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Register { player_id } => {
                match self.ledger.player(&player_id) {
                    Ok(_) => {
                        // At most one player per attachment; a re-register
                        // replaces the binding.
                        self.registrations
                            .insert(client_id.to_string(), player_id.clone());
                        info!(client = %client_id, player = %player_id, "Observer registered");
                        ServerMessage::Registered { player_id }
                    }
                    Err(e) => ServerMessage::RegisterError {
                        message: e.to_string(),
                    },
                }
            }
            ClientMessage::CashOut { player_id } => {
                let Some(player_id) = player_id.or_else(|| self.registered_player(client_id)) else {
                    return ServerMessage::CashoutErr {
                        code: "validation".to_string(),
                        message: "No player registered on this attachment".to_string(),
                    };
                };

                match self.engine.cash_out(&player_id).await {
                    Ok(receipt) => ServerMessage::cashout_ok(receipt),
                    Err(e) => ServerMessage::CashoutErr {
                        code: error_code(&e).to_string(),
                        message: e.to_string(),
                    },
                }
            }
            ClientMessage::GetState => {
                let snapshot = self.engine.snapshot().await;
                ServerMessage::State {
                    active: snapshot.is_some(),
                    snapshot,
                }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    fn finish_connection(&self, client_id: &str) {
        self.registrations.remove(client_id);
        let remaining = self.client_count.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(client = %client_id, remaining, "Observer detached");
    }
}

async fn send_json<S, T>(sender: &mut S, payload: &T) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
    T: Serialize,
{
    let json = match serde_json::to_string(payload) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize outbound frame: {}", e);
            return Ok(());
        }
    };

    sender.send(Message::Text(json)).await.map_err(|_| ())
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// GET /ws upgrade handler
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_connection(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let register: ClientMessage =
            serde_json::from_str(r#"{"type":"register","player_id":"alice"}"#).unwrap();
        assert!(matches!(register, ClientMessage::Register { player_id } if player_id == "alice"));

        let cashout: ClientMessage = serde_json::from_str(r#"{"type":"cash_out"}"#).unwrap();
        assert!(matches!(cashout, ClientMessage::CashOut { player_id: None }));

        let cashout_for: ClientMessage =
            serde_json::from_str(r#"{"type":"cash_out","player_id":"bob"}"#).unwrap();
        assert!(
            matches!(cashout_for, ClientMessage::CashOut { player_id: Some(p) } if p == "bob")
        );

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"get_state"}"#).is_ok());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).is_ok());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let pong = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(pong["type"], "pong");

        let err = serde_json::to_value(ServerMessage::CashoutErr {
            code: "state".to_string(),
            message: "Round is not live".to_string(),
        })
        .unwrap();
        assert_eq!(err["type"], "cashout_err");
        assert_eq!(err["code"], "state");
    }
}
