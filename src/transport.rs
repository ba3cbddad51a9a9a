//! Duplex transport for the agent session
//!
//! The session talks to the remote agent through the `Transport` trait:
//! fire-and-forget outbound sends and a single inbound message channel.
//! `WsTransport` is the production implementation; integration tests swap in
//! a channel-backed mock.
//!
//! # Connection Flow
//!
//! 1. `WsTransport::connect()` - Establish WebSocket (with retries)
//! 2. Outbound messages are queued to a writer task (never blocks capture)
//! 3. Inbound messages are parsed by a background task into the channel
//! 4. `close()` - Queue a close message and shut the socket down

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};

use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Connection timeout for the initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum retry attempts for the initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Duplex message transport to the remote agent
///
/// Sends never block the caller; inbound messages arrive on the receiver
/// taken via `take_incoming`. `close` must be idempotent.
pub trait Transport: Send + 'static {
    /// Queue a message for sending. Fire-and-forget: failures are logged,
    /// not surfaced, so the capture callback is never stalled.
    fn send(&self, msg: ClientMessage);

    /// Take ownership of the inbound message receiver.
    ///
    /// Returns `None` if already taken.
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<ServerMessage>>;

    /// Signal the transport to close. Idempotent.
    fn close(&mut self);
}

/// Endpoint configuration, resolved from the environment
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint of the agent session service
    pub url: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
}

impl TransportConfig {
    /// Read `VOXPENSE_AGENT_URL` / `VOXPENSE_API_KEY`, honoring a local
    /// `.env` file if present.
    pub fn from_env() -> Result<Self, SessionError> {
        let _ = dotenvy::dotenv();
        let url = std::env::var("VOXPENSE_AGENT_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                SessionError::Transport("VOXPENSE_AGENT_URL is not set".to_string())
            })?;
        let api_key = std::env::var("VOXPENSE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self { url, api_key })
    }
}

/// WebSocket transport to the agent session service
pub struct WsTransport {
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    incoming_rx: Option<mpsc::Receiver<ServerMessage>>,
    writer_task: tokio::task::JoinHandle<()>,
    receiver_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

impl WsTransport {
    /// Connect to the agent with retries and exponential backoff.
    pub async fn connect(config: &TransportConfig) -> Result<Self, SessionError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying agent connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(config).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SessionError::Transport("Max retries exceeded".to_string())))
    }

    /// Single connection attempt (no retries)
    async fn try_connect(config: &TransportConfig) -> Result<Self, SessionError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        if let Some(key) = &config.api_key {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| SessionError::Transport(e.to_string()))?,
            );
        }

        log::info!("Connecting to agent session at {}...", config.url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| SessionError::Transport("Connection timeout".to_string()))?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

        log::info!("Agent session transport connected");

        let (mut write, mut read) = ws_stream.split();

        // Writer task: drains the outbound queue so sends never block the
        // capture path. A Close message flushes a close frame and exits.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, ClientMessage::Close);
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("Outbound send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to serialize outbound message: {}", e),
                }
                if is_close {
                    if let Err(e) = write.close().await {
                        log::warn!("Error closing WebSocket: {}", e);
                    }
                    break;
                }
            }
            log::debug!("Writer task exiting");
        });

        // Receiver task: parse inbound frames into the session channel
        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let receiver_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text)
                    {
                        Ok(msg) => {
                            if incoming_tx.send(msg).await.is_err() {
                                log::debug!("Inbound channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("Failed to parse inbound message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("WebSocket closed by agent");
                        let _ = incoming_tx.send(ServerMessage::Close).await;
                        break;
                    }
                    Err(e) => {
                        log::warn!("WebSocket error: {}", e);
                        let _ = incoming_tx
                            .send(ServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            log::debug!("Receiver task exiting");
        });

        Ok(Self {
            outbound_tx,
            incoming_rx: Some(incoming_rx),
            writer_task,
            receiver_task,
            closed: false,
        })
    }
}

impl Transport for WsTransport {
    fn send(&self, msg: ClientMessage) {
        if self.outbound_tx.send(msg).is_err() {
            log::debug!("Dropping outbound message, transport already closed");
        }
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.incoming_rx.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Queue the close; the writer task flushes the frame and exits
        let _ = self.outbound_tx.send(ClientMessage::Close);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        // Ensure the background tasks stop if close() was never awaited
        self.receiver_task.abort();
        if !self.closed {
            self.writer_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; tests that touch them must not interleave
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_config_from_env_requires_url() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::remove_var("VOXPENSE_AGENT_URL");
        let result = TransportConfig::from_env();
        assert!(matches!(result, Err(SessionError::Transport(_))));
    }

    #[tokio::test]
    #[ignore] // Requires a reachable agent endpoint
    async fn test_ws_connect() {
        let config = {
            let _env = ENV_LOCK.lock().unwrap();
            TransportConfig::from_env().expect("VOXPENSE_AGENT_URL required")
        };
        let mut transport = WsTransport::connect(&config).await.expect("connect");
        assert!(transport.take_incoming().is_some());
        transport.close();
        transport.close();
    }
}
