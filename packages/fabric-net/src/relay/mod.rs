//! C3: the relay (comm-server) listener. Maintains a spare pool of
//! concurrent registrations against a relay URL so that a replacement is
//! already in flight by the time one registration gets consumed by an
//! incoming peer (spec §4.3).
//!
//! Grounded on the teacher's `NetworkModule` deferred-startup/shutdown
//! lifecycle (`network/module.rs`): a long-lived task per registration,
//! reconnecting with backoff, handed off to the caller once a peer
//! connects — generalized here from "accept HTTP and build a router" to
//! "register with a relay and hand off a raw connection".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use fabric_core::{bit_invert, seal, FabricError, InstanceId, RelayMessage, SecretEncryptKey};

use crate::config::{jittered, FabricConfig};
use crate::framed::FramedConnection;
use crate::hsm::{HistoryLevel, StateMachine};

/// Builds the per-registration lifecycle machine driving `registration_loop`
/// (spec §4.3): `NotListening` while idle or between registrations,
/// `Connecting` while dialing and authenticating, `Listening` once the
/// relay has accepted the registration and a peer may arrive at any
/// moment, `Handover` once one has (spec §4.3 step 4).
fn registration_state_machine() -> StateMachine {
    let mut sm = StateMachine::new();
    sm.add_state("not_listening", None);
    sm.add_state("connecting", None);
    sm.add_state("listening", None);
    sm.add_state("handover", None);

    sm.add_event("dial");
    sm.add_event("authenticated");
    sm.add_event("handed_over");
    sm.add_event("failed");

    sm.add_transition("dial", "not_listening", "connecting", HistoryLevel::Reset);
    sm.add_transition("dial", "handover", "connecting", HistoryLevel::Reset);
    sm.add_transition("authenticated", "connecting", "listening", HistoryLevel::Reset);
    sm.add_transition("handed_over", "listening", "handover", HistoryLevel::Reset);
    sm.add_transition("failed", "connecting", "not_listening", HistoryLevel::Reset);
    sm.add_transition("failed", "listening", "not_listening", HistoryLevel::Reset);

    sm.set_initial_state("not_listening");
    sm.start();
    sm
}

/// A raw framed connection handed over by the relay, ready for the
/// handshake layer (spec §4.3 step 4).
pub struct HandedOverConnection {
    pub relay_url: String,
    pub local_instance_key: InstanceId,
    pub conn: FramedConnection,
}

/// Runs `spare_count` concurrent registrations against `relay_url` for
/// `local_instance_key`, sending every connection handed over by the
/// relay on `handoff_tx`. Runs until the returned task is aborted.
///
/// `local_secret` is the instance's long-term secret, used to answer the
/// relay's authentication challenge (spec §4.3 step 3); per the
/// concurrency model's shared-resource policy it is borrowed, not owned,
/// by this module beyond the lifetime of this call.
pub fn spawn(
    relay_url: String,
    local_instance_key: InstanceId,
    local_secret: Arc<SecretEncryptKey>,
    config: FabricConfig,
    handoff_tx: mpsc::Sender<HandedOverConnection>,
) -> RelayListenerHandle {
    let listening_count = Arc::new(AtomicUsize::new(0));
    let cancel = Arc::new(tokio::sync::Notify::new());

    for _ in 0..config.relay_spare_count {
        tokio::spawn(registration_loop(
            relay_url.clone(),
            local_instance_key,
            Arc::clone(&local_secret),
            config.clone(),
            handoff_tx.clone(),
            Arc::clone(&listening_count),
            Arc::clone(&cancel),
        ));
    }

    RelayListenerHandle {
        listening_count,
        cancel,
    }
}

/// Handle to a running relay listener's spare pool.
pub struct RelayListenerHandle {
    listening_count: Arc<AtomicUsize>,
    cancel: Arc<tokio::sync::Notify>,
}

impl RelayListenerHandle {
    /// Aggregated state: listening iff at least one spare registration is
    /// currently `Listening` (spec §4.3).
    #[must_use]
    pub fn is_listening(&self) -> bool {
        let listening = self.listening_count.load(Ordering::SeqCst) > 0;
        metrics::gauge!("fabric_relay_listening").set(if listening { 1.0 } else { 0.0 });
        listening
    }

    /// Cancels every spare registration for this relay/instance pair.
    pub fn stop(&self) {
        self.cancel.notify_waiters();
    }
}

async fn registration_loop(
    relay_url: String,
    local_instance_key: InstanceId,
    local_secret: Arc<SecretEncryptKey>,
    config: FabricConfig,
    handoff_tx: mpsc::Sender<HandedOverConnection>,
    listening_count: Arc<AtomicUsize>,
    cancel: Arc<tokio::sync::Notify>,
) {
    let mut sm = registration_state_machine();

    let enter_count = Arc::clone(&listening_count);
    let _on_enter = sm.on_enter.subscribe(move |state| {
        if state == "listening" {
            enter_count.fetch_add(1, Ordering::SeqCst);
        }
    });
    let leave_count = Arc::clone(&listening_count);
    let _on_leave = sm.on_leave.subscribe(move |state| {
        if state == "listening" {
            leave_count.fetch_sub(1, Ordering::SeqCst);
        }
    });

    loop {
        sm.handle_event("dial");

        let attempt = tokio::select! {
            result = register_once(&relay_url, local_instance_key, &local_secret, &config, &mut sm) => result,
            () = cancel.notified() => return,
        };

        match attempt {
            Ok(conn) => {
                sm.handle_event("handed_over");
                if handoff_tx
                    .send(HandedOverConnection {
                        relay_url: relay_url.clone(),
                        local_instance_key,
                        conn,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                // A fresh registration replaces the one just consumed
                // (spec §4.3 step 4, "start a replacement registration").
            }
            Err(err) => {
                sm.handle_event("failed");
                warn!(relay_url = %relay_url, error = %err, "relay registration failed");
                metrics::counter!("fabric_reconnect_attempts_total").increment(1);
                let delay = jittered(config.relay_reconnect_interval);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.notified() => return,
                }
            }
        }
    }
}

async fn register_once(
    relay_url: &str,
    local_instance_key: InstanceId,
    local_secret: &SecretEncryptKey,
    config: &FabricConfig,
    sm: &mut StateMachine,
) -> Result<FramedConnection, FabricError> {
    let (ws, _) = connect_async(relay_url)
        .await
        .map_err(|e| FabricError::TransportClosed(format!("relay dial failed: {e}")))?;

    let conn = FramedConnection::spawn(
        ws,
        config.max_frame_size,
        config.keepalive_interval,
        config.keepalive_missed_limit,
    );

    conn.send_json(&RelayMessage::Register {
        public_key: local_instance_key,
    })
    .await?;

    let request = conn.wait_for_json_message("authentication_request").await?;
    let challenge_b64 = request
        .get("challenge")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FabricError::ProtocolViolation("missing challenge".into()))?;
    let relay_pub_b64 = request
        .get("publicKey")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FabricError::ProtocolViolation("missing relay public key".into()))?;

    use base64::Engine;
    let challenge = base64::engine::general_purpose::STANDARD
        .decode(challenge_b64)
        .map_err(|_| FabricError::ProtocolViolation("bad challenge encoding".into()))?;
    let relay_pub_bytes = base64::engine::general_purpose::STANDARD
        .decode(relay_pub_b64)
        .map_err(|_| FabricError::ProtocolViolation("bad relay key encoding".into()))?;
    let relay_pub_array: [u8; 32] = relay_pub_bytes
        .try_into()
        .map_err(|_| FabricError::ProtocolViolation("malformed relay public key".into()))?;

    // The challenge is sealed for us under our own long-term key by the
    // relay in the reference wire format; here we model the relay as
    // having sealed it for this instance directly.
    let sealed = fabric_core::SealedBox {
        ephemeral_public: fabric_core::PublicEncryptKey(relay_pub_array),
        nonce: challenge
            .get(..12)
            .and_then(|s| s.try_into().ok())
            .unwrap_or([0; 12]),
        ciphertext: challenge.get(12..).map(<[u8]>::to_vec).unwrap_or_default(),
    };
    let decrypted = fabric_core::open_sealed(local_secret, &sealed)?;
    let response_plain = bit_invert(&decrypted);
    let sealed_response = seal(&fabric_core::PublicEncryptKey(relay_pub_array), &response_plain);
    let response_bytes = serde_json::to_vec(&sealed_response)
        .map_err(|e| FabricError::Internal(format!("serialize response: {e}")))?;
    let response_b64 = base64::engine::general_purpose::STANDARD.encode(response_bytes);

    conn.send_json(&RelayMessage::AuthenticationResponse {
        response: response_b64,
    })
    .await?;

    sm.handle_event("authenticated");
    let handover = conn.wait_for_json_message("connection_handover").await;
    handover?;

    debug!(relay_url = %relay_url, "relay connection handed over");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_reports_not_listening_with_zero_spares() {
        let handle = RelayListenerHandle {
            listening_count: Arc::new(AtomicUsize::new(0)),
            cancel: Arc::new(tokio::sync::Notify::new()),
        };
        assert!(!handle.is_listening());
    }

    #[test]
    fn handle_reports_listening_with_one_spare() {
        let handle = RelayListenerHandle {
            listening_count: Arc::new(AtomicUsize::new(1)),
            cancel: Arc::new(tokio::sync::Notify::new()),
        };
        assert!(handle.is_listening());
    }

    #[test]
    fn registration_machine_walks_the_full_lifecycle_and_loops() {
        let mut sm = registration_state_machine();
        assert_eq!(sm.current_state(), Some("not_listening"));

        assert!(sm.handle_event("dial"));
        assert_eq!(sm.current_state(), Some("connecting"));

        assert!(sm.handle_event("authenticated"));
        assert_eq!(sm.current_state(), Some("listening"));

        assert!(sm.handle_event("handed_over"));
        assert_eq!(sm.current_state(), Some("handover"));

        // A fresh registration starts immediately after a handover.
        assert!(sm.handle_event("dial"));
        assert_eq!(sm.current_state(), Some("connecting"));
    }

    #[test]
    fn registration_machine_returns_to_not_listening_on_failure() {
        let mut sm = registration_state_machine();
        sm.handle_event("dial");
        assert!(sm.handle_event("failed"));
        assert_eq!(sm.current_state(), Some("not_listening"));
    }

    #[test]
    fn listening_count_tracks_machine_transitions() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut sm = registration_state_machine();
        let enter_count = Arc::clone(&count);
        let _on_enter = sm.on_enter.subscribe(move |state| {
            if state == "listening" {
                enter_count.fetch_add(1, Ordering::SeqCst);
            }
        });
        let leave_count = Arc::clone(&count);
        let _on_leave = sm.on_leave.subscribe(move |state| {
            if state == "listening" {
                leave_count.fetch_sub(1, Ordering::SeqCst);
            }
        });

        sm.handle_event("dial");
        sm.handle_event("authenticated");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sm.handle_event("handed_over");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
