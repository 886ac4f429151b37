//! A duplex framed message stream over any `tokio-tungstenite` websocket,
//! with transparent post-handshake encryption and keepalive built in.
//! Grounded on the teacher's `ConnectionHandle` (an `mpsc`-backed handle
//! with a shared `connected_at`/metadata and `try_send`/`send_timeout`):
//! the same shape here, generalized to carry an optional session cipher
//! and a background read/write pump instead of being driven by an axum
//! websocket upgrade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use fabric_core::FabricError;

use crate::framed::encryption::SessionCipher;

/// Lifecycle of a framed connection (spec §3, Framed Connection states).
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

struct Shared {
    state: RwLock<ConnectionState>,
    cipher: RwLock<Option<SessionCipher>>,
    last_pong: RwLock<Instant>,
    missed_pongs: AtomicU32,
    close_reason: RwLock<Option<FabricError>>,
    closed_notify: tokio::sync::Notify,
}

/// A duplex, framed, optionally-encrypted message stream.
///
/// `send`/`wait_for_*` suspend (spec §5); everything else is non-blocking
/// map manipulation.
pub struct FramedConnection {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

const OUTBOUND_CAPACITY: usize = 64;

impl FramedConnection {
    /// Spawns the read/write pump over `ws` and returns a handle. The
    /// connection starts in `Open` (the websocket handshake already
    /// completed by the time this is called); the fabric-level handshake
    /// (§4.5) runs as ordinary messages over the returned connection.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        max_frame_size: usize,
        keepalive_interval: Duration,
        keepalive_missed_limit: u32,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Open),
            cipher: RwLock::new(None),
            last_pong: RwLock::new(Instant::now()),
            missed_pongs: AtomicU32::new(0),
            close_reason: RwLock::new(None),
            closed_notify: tokio::sync::Notify::new(),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);

        tokio::spawn(pump(
            ws,
            Arc::clone(&shared),
            outbound_rx,
            inbound_tx,
            max_frame_size,
            keepalive_interval,
            keepalive_missed_limit,
        ));

        Self {
            shared,
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Installs the session cipher once the ephemeral-key exchange
    /// completes. Frames sent/received afterward are transparently
    /// wrapped/unwrapped (spec §4.1, §4.5(a)).
    pub fn install_encryption(&self, session_key: [u8; 32]) {
        *self.shared.cipher.write() = Some(SessionCipher::new(session_key));
    }

    /// Sends `bytes` as a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::TransportClosed`] if the connection is not
    /// open.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), FabricError> {
        if self.state() != ConnectionState::Open {
            return Err(FabricError::TransportClosed("not open".into()));
        }
        let frame = match self.shared.cipher.read().as_ref() {
            Some(cipher) => cipher.encrypt(&bytes),
            None => bytes,
        };
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| FabricError::TransportClosed("write task gone".into()))
    }

    /// Serializes `value` as JSON and sends it as a single frame.
    pub async fn send_json(&self, value: &impl serde::Serialize) -> Result<(), FabricError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FabricError::Internal(format!("serialize: {e}")))?;
        self.send(bytes).await
    }

    /// Waits for and returns the next raw binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::TransportClosed`] once the peer or pump
    /// closes without delivering another frame.
    pub async fn wait_for_binary_message(&self) -> Result<Vec<u8>, FabricError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| FabricError::TransportClosed("stream ended".into()))
    }

    /// Waits for the next frame and decodes it as a `T`.
    pub async fn wait_for_message<T: DeserializeOwned>(&self) -> Result<T, FabricError> {
        let bytes = self.wait_for_binary_message().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FabricError::ProtocolViolation(format!("malformed json: {e}")))
    }

    /// Waits for the next frame, requiring it to be a JSON object whose
    /// `command` field equals `expected_command` (spec §4.1).
    pub async fn wait_for_json_message(
        &self,
        expected_command: &str,
    ) -> Result<serde_json::Value, FabricError> {
        let bytes = self.wait_for_binary_message().await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| FabricError::ProtocolViolation(format!("malformed json: {e}")))?;
        match value.get("command").and_then(serde_json::Value::as_str) {
            Some(cmd) if cmd == expected_command => Ok(value),
            Some(other) => Err(FabricError::ProtocolViolation(format!(
                "expected command {expected_command}, got {other}"
            ))),
            None => Err(FabricError::ProtocolViolation("missing command field".into())),
        }
    }

    /// Idempotently closes the connection.
    pub fn close(&self, reason: Option<FabricError>) {
        let mut state = self.shared.state.write();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
        *self.shared.close_reason.write() = reason;
        drop(state);
        self.shared.closed_notify.notify_waiters();
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<FabricError> {
        self.shared.close_reason.read().clone()
    }

    /// Resolves once the connection reaches `Closed`, whether from a local
    /// `close()`, a peer disconnect, or a pump-detected failure. Used by
    /// the route manager to detect when an active connection needs
    /// rescheduling (spec §4.6, `assignNewConnection`'s close handler).
    pub async fn wait_closed(&self) {
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            let notified = self.shared.closed_notify.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }
}

async fn pump<S>(
    mut ws: WebSocketStream<S>,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    max_frame_size: usize,
    keepalive_interval: Duration,
    keepalive_missed_limit: u32,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(keepalive_interval);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if ws.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.len() > max_frame_size {
                            *shared.state.write() = ConnectionState::Closed;
                            *shared.close_reason.write() = Some(FabricError::FrameTooLarge);
                            break;
                        }
                        if is_pong(&data) {
                            *shared.last_pong.write() = Instant::now();
                            shared.missed_pongs.store(0, Ordering::SeqCst);
                            continue;
                        }
                        if is_ping(&data) {
                            let pong = br#"{"command":"comm_pong"}"#.to_vec();
                            if ws.send(WsMessage::Binary(pong.into())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let plaintext = match shared.cipher.read().as_ref() {
                            Some(cipher) => match cipher.decrypt(&data) {
                                Ok(p) => p,
                                Err(_) => {
                                    *shared.state.write() = ConnectionState::Closed;
                                    *shared.close_reason.write() = Some(FabricError::DecryptionFailed);
                                    break;
                                }
                            },
                            None => data.to_vec(),
                        };
                        if inbound_tx.send(plaintext).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => break,
                }
            }
            _ = ticker.tick() => {
                let missed = shared.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
                if missed > keepalive_missed_limit {
                    *shared.state.write() = ConnectionState::Closed;
                    *shared.close_reason.write() = Some(FabricError::KeepaliveTimeout);
                    break;
                }
                let ping = br#"{"command":"comm_ping"}"#.to_vec();
                let frame = match shared.cipher.read().as_ref() {
                    Some(cipher) => cipher.encrypt(ping.as_slice()),
                    None => ping,
                };
                if ws.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let mut state = shared.state.write();
    let already_closed = *state == ConnectionState::Closed;
    *state = ConnectionState::Closed;
    drop(state);
    if !already_closed {
        let mut reason = shared.close_reason.write();
        if reason.is_none() {
            *reason = Some(FabricError::TransportClosed("connection ended".into()));
        }
    }
    shared.closed_notify.notify_waiters();
}

fn is_ping(data: &[u8]) -> bool {
    matches_command(data, "comm_ping")
}

fn is_pong(data: &[u8]) -> bool {
    matches_command(data, "comm_pong")
}

fn matches_command(data: &[u8], command: &str) -> bool {
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("command").and_then(serde_json::Value::as_str).map(str::to_owned))
        .is_some_and(|cmd| cmd == command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_command_detects_ping_and_pong() {
        assert!(is_ping(br#"{"command":"comm_ping"}"#));
        assert!(is_pong(br#"{"command":"comm_pong"}"#));
        assert!(!is_ping(br#"{"command":"comm_pong"}"#));
        assert!(!is_pong(br#"{"command":"other"}"#));
    }
}
