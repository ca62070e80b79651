//! # Reconnecting Counter Client
//!
//! A WebSocket client for the counter protocol, used by the end-to-end
//! tests and by bots driving a server.
//!
//! ```text
//!   connect ──ok──► send get_viewer_count ──► { ping every 5s
//!      ▲                                        forward outbound
//!      │                                        surface inbound }
//!      │                                              │ lost
//!      └──── sleep min(1s × 2^attempt, 30s) ◄─────────┘
//! ```
//!
//! The attempt counter resets on every successful open. The server sends the
//! current value as the first frame of every connection, so a reconnect
//! resynchronizes without any client-side replay.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::codec::{decode_server_message, encode_client_message, ClientMessage, ServerMessage};
use crate::error::{Error, Result};

/// Client timing.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ping_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// What the client observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
}

/// Handle to a background connection loop.
pub struct CounterClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

impl CounterClient {
    /// Starts connecting to `url` (e.g. `ws://127.0.0.1:8080/ws`).
    pub fn connect(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::connect_with_config(url, ClientConfig::default())
    }

    /// Starts connecting with custom timing.
    pub fn connect_with_config(
        url: impl Into<String>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_client(url.into(), config, outbound_rx, events_tx));
        (Self { outbound, task }, events)
    }

    /// Queues a message. Sent on the current connection, or the next one.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound.send(message).map_err(|_| Error::ClientClosed)
    }

    /// Sends a close hint and stops the connection loop.
    pub async fn close(self) {
        let _ = self.outbound.send(ClientMessage::Close {
            reason: Some("client shutdown".to_string()),
        });
        drop(self.outbound);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            abort.abort();
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff(attempt: u32, config: &ClientConfig) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .min_backoff
        .checked_mul(factor)
        .unwrap_or(config.max_backoff)
        .min(config.max_backoff)
}

enum Disconnect {
    /// Connection lost; reconnect.
    Lost,
    /// The client handle was dropped or closed.
    Stop,
}

async fn run_client(
    url: String,
    config: ClientConfig,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut attempt = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                info!(url = %url, "connected");
                if events.send(ClientEvent::Connected).is_err() {
                    return;
                }

                let outcome = drive_connection(socket, &config, &mut outbound, &events).await;

                if events.send(ClientEvent::Disconnected).is_err() {
                    return;
                }
                if let Disconnect::Stop = outcome {
                    return;
                }
            }
            Err(e) => warn!(url = %url, attempt, error = %e, "connect failed"),
        }

        let delay = backoff(attempt, &config);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = events.closed() => return,
        }
    }
}

async fn drive_connection<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    config: &ClientConfig,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Disconnect
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    if sink
        .send(Message::text(encode_client_message(&ClientMessage::GetViewerCount)))
        .await
        .is_err()
    {
        return Disconnect::Lost;
    }

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let frame = Message::text(encode_client_message(&ClientMessage::Ping));
                if sink.send(frame).await.is_err() {
                    return Disconnect::Lost;
                }
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    let closing = matches!(message, ClientMessage::Close { .. });
                    if sink.send(Message::text(encode_client_message(&message))).await.is_err() {
                        return Disconnect::Lost;
                    }
                    if closing {
                        let _ = sink.close().await;
                        return Disconnect::Stop;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return Disconnect::Stop;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => match decode_server_message(text.as_str()) {
                    Ok(message) => {
                        if events.send(ClientEvent::Message(message)).is_err() {
                            let _ = sink.close().await;
                            return Disconnect::Stop;
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable server frame"),
                },
                Some(Ok(Message::Close(_))) | None => return Disconnect::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "socket error");
                    return Disconnect::Lost;
                }
            },
        }
    }
}
