//! Websocket transport.
//!
//! Outbound events funnel through an in-process channel so the engine never
//! touches the socket directly; a single driver task owns the connection,
//! feeds inbound events into [`Messenger::handle_server_event`], and
//! reconnects with capped exponential backoff when the relay goes away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use shared::protocol::{ClientEvent, ServerEvent};

use crate::{EventSink, Messenger};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// [`EventSink`] half handed to the engine; pairs with the receiver the
/// driver consumes.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

pub fn channel_sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink { tx }), rx)
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("transport task has shut down"))
    }
}

/// Derive the relay websocket endpoint from its base HTTP url.
pub fn relay_ws_url(server_url: &str) -> Result<Url> {
    let ws = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server url must start with http:// or https://"));
    };
    let ws = format!("{}/ws", ws.trim_end_matches('/'));
    Url::parse(&ws).with_context(|| format!("invalid relay url: {ws}"))
}

enum Disconnect {
    /// The engine dropped its sink; we are shutting down for good.
    OutboundClosed,
    /// The relay went away; reconnect.
    Remote,
}

/// Run the connection loop until the outbound channel closes. Intended to be
/// spawned once per process.
pub async fn run(
    url: Url,
    client: Arc<Messenger>,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(%url, "connected to relay");
                backoff = INITIAL_BACKOFF;
                client.handle_connected().await;
                let disconnect = drive(stream, &client, &mut outbound).await;
                client.handle_disconnected().await;
                if matches!(disconnect, Disconnect::OutboundClosed) {
                    return;
                }
                warn!(%url, "relay connection lost, reconnecting");
            }
            Err(error) => {
                warn!(%url, %error, "failed to reach relay");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn drive(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client: &Arc<Messenger>,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Disconnect {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(event) = queued else {
                    let _ = writer.send(WsMessage::Close(None)).await;
                    return Disconnect::OutboundClosed;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "dropping unserializable outbound event");
                        continue;
                    }
                };
                if let Err(error) = writer.send(WsMessage::Text(text)).await {
                    warn!(%error, "websocket send failed");
                    return Disconnect::Remote;
                }
            }
            incoming = reader.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => client.handle_server_event(event).await,
                            Err(error) => {
                                warn!(%error, "discarding unparseable relay event");
                            }
                        }
                    }
                    // tungstenite answers pings on flush; nothing to do.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => return Disconnect::Remote,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "websocket receive failed");
                        return Disconnect::Remote;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derivation() {
        assert_eq!(
            relay_ws_url("http://127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/ws"
        );
        assert_eq!(
            relay_ws_url("https://relay.example.com/").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert!(relay_ws_url("ftp://nope").is_err());
    }
}
