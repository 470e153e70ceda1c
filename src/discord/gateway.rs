//! Discord gateway connector.
//!
//! Connects to the gateway WebSocket, identifies with the bot token and
//! streams MESSAGE_CREATE dispatches as [`ChatEvent`]s. Messages written by
//! the bot itself are dropped. The connection is re-established with
//! exponential backoff whenever it ends.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;
const OP_HEARTBEAT_ACK: u64 = 11;

const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed before hello")]
    NoHello,
    #[error("event receiver dropped")]
    ReceiverDropped,
}

/// An inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub author_id: String,
    pub author_name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u64,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    author: Author,
    #[serde(default)]
    content: String,
}

/// Spawn the gateway task. Events arrive on `event_tx` until the receiver
/// is dropped.
pub fn start_gateway(gateway_url: String, token: String, event_tx: mpsc::UnboundedSender<ChatEvent>) {
    tokio::spawn(async move {
        run_gateway(gateway_url, token, event_tx).await;
    });
}

async fn run_gateway(gateway_url: String, token: String, event_tx: mpsc::UnboundedSender<ChatEvent>) {
    let mut backoff = RECONNECT_BASE;

    loop {
        info!(url = %gateway_url, "connecting to Discord gateway");

        match connect_and_stream(&gateway_url, &token, &event_tx).await {
            Ok(()) => {
                info!("Discord gateway closed cleanly");
                backoff = RECONNECT_BASE;
            }
            Err(GatewayError::ReceiverDropped) => {
                info!("chat event receiver gone, stopping gateway");
                return;
            }
            Err(e) => {
                error!(error = %e, "Discord gateway error");
            }
        }

        info!(delay = ?backoff, "reconnecting to Discord gateway");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
    }
}

fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "turnip-finder",
                "device": "turnip-finder",
            },
        },
    })
}

fn heartbeat_payload(seq: i64) -> Value {
    let d = if seq < 0 { Value::Null } else { json!(seq) };
    json!({ "op": OP_HEARTBEAT, "d": d })
}

async fn connect_and_stream(
    gateway_url: &str,
    token: &str,
    event_tx: &mpsc::UnboundedSender<ChatEvent>,
) -> Result<(), GatewayError> {
    let (ws_stream, _response) = connect_async(gateway_url).await?;
    let (mut write, mut read) = ws_stream.split();

    // First frame must be Hello with the heartbeat interval
    let heartbeat_interval = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if payload.op == OP_HELLO {
                    let ms = payload
                        .d
                        .get("heartbeat_interval")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(41_250);
                    break Duration::from_millis(ms);
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(GatewayError::NoHello),
        }
    };

    write
        .send(Message::Text(identify_payload(token).to_string()))
        .await?;
    info!(heartbeat = ?heartbeat_interval, "identified with Discord gateway");

    let seq = Arc::new(AtomicI64::new(-1));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    // Writer task owns the sink: heartbeats on a timer plus anything the
    // reader asks to send.
    let writer = tokio::spawn({
        let seq = seq.clone();
        async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                let payload = tokio::select! {
                    _ = ticker.tick() => heartbeat_payload(seq.load(Ordering::SeqCst)),
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if let Err(e) = write.send(Message::Text(payload.to_string())).await {
                    warn!(error = %e, "failed to write to Discord gateway");
                    break;
                }
            }
        }
    });

    let mut bot_user_id = String::new();
    let mut result = Ok(());

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let payload: GatewayPayload = match serde_json::from_str(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to decode gateway payload");
                        continue;
                    }
                };
                if let Some(s) = payload.s {
                    seq.store(s, Ordering::SeqCst);
                }

                match payload.op {
                    OP_DISPATCH => {
                        if let Some(event) = process_dispatch(&payload, &mut bot_user_id) {
                            if event_tx.send(event).is_err() {
                                result = Err(GatewayError::ReceiverDropped);
                                break;
                            }
                        }
                    }
                    OP_HEARTBEAT => {
                        let _ = out_tx.send(heartbeat_payload(seq.load(Ordering::SeqCst)));
                    }
                    OP_HEARTBEAT_ACK => debug!("gateway heartbeat ack"),
                    OP_RECONNECT | OP_INVALID_SESSION => {
                        warn!(op = payload.op, "gateway asked us to reconnect");
                        break;
                    }
                    op => debug!(op, "unhandled gateway opcode"),
                }
            }
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "Discord gateway sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Discord gateway read error");
                break;
            }
        }
    }

    drop(out_tx);
    writer.abort();

    result
}

/// Turn a dispatch payload into a chat event. Records the bot's own id from
/// READY so its messages can be skipped.
fn process_dispatch(payload: &GatewayPayload, bot_user_id: &mut String) -> Option<ChatEvent> {
    match payload.t.as_deref() {
        Some("READY") => {
            if let Some(id) = payload.d.pointer("/user/id").and_then(|v| v.as_str()) {
                *bot_user_id = id.to_string();
                info!(bot_user = %id, "Discord session ready");
            }
            None
        }
        Some("MESSAGE_CREATE") => {
            let msg: MessageCreate = match serde_json::from_value(payload.d.clone()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "malformed MESSAGE_CREATE");
                    return None;
                }
            };
            if msg.author.bot || msg.author.id == *bot_user_id || msg.content.is_empty() {
                return None;
            }
            Some(ChatEvent {
                author_id: msg.author.id,
                author_name: msg.author.username,
                content: msg.content,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(t: &str, d: Value) -> GatewayPayload {
        GatewayPayload {
            op: OP_DISPATCH,
            d,
            s: Some(1),
            t: Some(t.to_string()),
        }
    }

    #[test]
    fn test_message_create_becomes_chat_event() {
        let mut bot = "999".to_string();
        let payload = dispatch(
            "MESSAGE_CREATE",
            json!({
                "author": { "id": "42", "username": "tom" },
                "content": "!sell 400",
                "channel_id": "7"
            }),
        );

        assert_eq!(
            process_dispatch(&payload, &mut bot),
            Some(ChatEvent {
                author_id: "42".to_string(),
                author_name: "tom".to_string(),
                content: "!sell 400".to_string(),
            })
        );
    }

    #[test]
    fn test_own_and_bot_messages_are_dropped() {
        let mut bot = String::new();
        let ready = dispatch("READY", json!({ "user": { "id": "999" } }));
        assert_eq!(process_dispatch(&ready, &mut bot), None);
        assert_eq!(bot, "999");

        let own = dispatch(
            "MESSAGE_CREATE",
            json!({ "author": { "id": "999", "username": "finder" }, "content": "hi" }),
        );
        assert_eq!(process_dispatch(&own, &mut bot), None);

        let other_bot = dispatch(
            "MESSAGE_CREATE",
            json!({ "author": { "id": "5", "username": "x", "bot": true }, "content": "!help" }),
        );
        assert_eq!(process_dispatch(&other_bot, &mut bot), None);
    }

    #[test]
    fn test_gateway_payload_decoding() {
        let hello: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":45000},"s":null,"t":null}"#)
                .unwrap();
        assert_eq!(hello.op, OP_HELLO);
        assert_eq!(hello.d["heartbeat_interval"], 45000);

        assert_eq!(heartbeat_payload(-1)["d"], Value::Null);
        assert_eq!(heartbeat_payload(12)["d"], 12);
        assert_eq!(identify_payload("tok")["d"]["intents"], 37376);
    }
}
