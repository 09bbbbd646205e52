//! Discord gateway connection.
//!
//! Hand-rolled v10 gateway session: hello, identify, heartbeat with sequence
//! tracking, and dispatch of the message events the bot consumes. The outer
//! loop reconnects with exponential backoff; a session only ends cleanly on
//! shutdown.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::rest::Rest;
use super::types::{DeletedMessage, Message, Ready};
use crate::config::Options;

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT | DIRECT_MESSAGES
const INTENTS: u64 = 1 | 512 | 32_768 | 4_096;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A session that survived this long resets the reconnect backoff.
const STABLE_SESSION: Duration = Duration::from_secs(60);

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;

/// Events forwarded from the gateway to the bot.
#[derive(Debug)]
pub enum GatewayEvent {
    Ready(Ready),
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete(DeletedMessage),
}

/// Connect and stay connected until `shutdown` fires, forwarding message
/// events into `tx`.
pub async fn run(
    options: Arc<Options>,
    rest: Rest,
    tx: mpsc::Sender<GatewayEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let started = tokio::time::Instant::now();
        match session(&options, &rest, &tx, &shutdown).await {
            Ok(()) => return Ok(()),
            Err(err) => tracing::warn!("gateway session ended: {err:#}"),
        }
        if started.elapsed() >= STABLE_SESSION {
            backoff = INITIAL_BACKOFF;
        }
        tracing::info!("reconnecting to gateway in {}s", backoff.as_secs());
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One gateway session. Returns `Ok(())` only when shutdown was requested;
/// every other exit is an error that the caller retries.
async fn session(
    options: &Options,
    rest: &Rest,
    tx: &mpsc::Sender<GatewayEvent>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let gw_url = rest.gateway_url().await?;
    let ws_url = format!("{gw_url}/?v=10&encoding=json");
    tracing::info!("connecting to gateway");

    let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .context("gateway connect failed")?;
    let (mut write, mut read) = ws.split();

    // Hello (op 10) carries the heartbeat interval.
    let hello = read
        .next()
        .await
        .ok_or_else(|| anyhow!("gateway closed before hello"))?
        .context("failed to read hello")?;
    let hello: serde_json::Value = serde_json::from_str(&hello.to_string())?;
    let heartbeat_ms = hello
        .get("d")
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);

    let identify = json!({
        "op": 2,
        "d": {
            "token": options.discord_token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "execbot",
                "device": "execbot"
            }
        }
    });
    write.send(WsMessage::Text(identify.to_string())).await?;
    tracing::info!("connected and identified");

    // Last dispatch sequence, echoed in heartbeats.
    let mut sequence: i64 = -1;
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                write
                    .send(WsMessage::Text(heartbeat_payload(sequence).to_string()))
                    .await
                    .context("heartbeat send failed")?;
            }
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(t))) => t,
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(anyhow!("gateway closed: {frame:?}"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err).context("gateway read failed"),
                    None => return Err(anyhow!("gateway stream ended")),
                };

                let event: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                if let Some(s) = event.get("s").and_then(serde_json::Value::as_i64) {
                    sequence = s;
                }

                match event.get("op").and_then(serde_json::Value::as_u64).unwrap_or(0) {
                    // Immediate heartbeat request.
                    1 => {
                        write
                            .send(WsMessage::Text(heartbeat_payload(sequence).to_string()))
                            .await
                            .context("heartbeat send failed")?;
                        continue;
                    }
                    7 => return Err(anyhow!("gateway requested reconnect (op 7)")),
                    9 => return Err(anyhow!("gateway invalidated session (op 9)")),
                    0 => {}
                    _ => continue,
                }

                let kind = event.get("t").and_then(|t| t.as_str()).unwrap_or("");
                let Some(data) = event.get("d").cloned() else { continue };
                let forwarded = match kind {
                    "READY" => match serde_json::from_value::<Ready>(data) {
                        Ok(ready) => {
                            on_ready(options, rest, &ready);
                            write
                                .send(WsMessage::Text(presence_payload(options.playing()).to_string()))
                                .await
                                .context("presence send failed")?;
                            Some(GatewayEvent::Ready(ready))
                        }
                        Err(err) => {
                            tracing::error!("malformed READY payload: {err}");
                            None
                        }
                    },
                    "MESSAGE_CREATE" => serde_json::from_value::<Message>(data)
                        .map(GatewayEvent::MessageCreate)
                        .ok(),
                    "MESSAGE_UPDATE" => serde_json::from_value::<Message>(data)
                        .map(GatewayEvent::MessageUpdate)
                        .ok(),
                    "MESSAGE_DELETE" => serde_json::from_value::<DeletedMessage>(data)
                        .map(GatewayEvent::MessageDelete)
                        .ok(),
                    _ => None,
                };
                if let Some(event) = forwarded {
                    if tx.send(event).await.is_err() {
                        return Err(anyhow!("event receiver dropped"));
                    }
                }
            }
        }
    }
}

fn heartbeat_payload(sequence: i64) -> serde_json::Value {
    let d = if sequence >= 0 {
        json!(sequence)
    } else {
        json!(null)
    };
    json!({ "op": 1, "d": d })
}

fn presence_payload(playing: &str) -> serde_json::Value {
    json!({
        "op": 3,
        "d": {
            "since": null,
            "activities": [{ "name": playing, "type": 0 }],
            "status": "online",
            "afk": false
        }
    })
}

/// Bring each guild's nickname in line with the configured one. Runs in the
/// background so a slow REST round-trip never stalls the gateway loop.
fn on_ready(options: &Options, rest: &Rest, ready: &Ready) {
    let nickname = options.nickname().to_string();
    let user_id = ready.user.id;
    let guild_ids: Vec<u64> = ready.guilds.iter().map(|g| g.id).collect();
    let rest = rest.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        for guild_id in guild_ids {
            match rest.member_nick(&cancel, guild_id, user_id).await {
                Ok(current) if current.as_deref() == Some(nickname.as_str()) => {}
                Ok(_) => {
                    if let Err(err) = rest.set_own_nick(&cancel, guild_id, &nickname).await {
                        tracing::error!("failed to update nickname in guild {guild_id}: {err:#}");
                    } else {
                        tracing::info!("updated nickname in guild {guild_id}");
                    }
                }
                Err(err) => {
                    tracing::error!("failed to get member in guild {guild_id}: {err:#}");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_echoes_sequence() {
        assert_eq!(heartbeat_payload(-1), json!({"op": 1, "d": null}));
        assert_eq!(heartbeat_payload(42), json!({"op": 1, "d": 42}));
    }

    #[test]
    fn presence_payload_sets_playing_activity() {
        let p = presence_payload("cat");
        assert_eq!(p["op"], 3);
        assert_eq!(p["d"]["activities"][0]["name"], "cat");
        assert_eq!(p["d"]["activities"][0]["type"], 0);
        assert_eq!(p["d"]["status"], "online");
    }

    #[test]
    fn intents_cover_required_events() {
        // guilds, guild messages, message content, direct messages
        assert_eq!(INTENTS, 37_377);
    }
}
