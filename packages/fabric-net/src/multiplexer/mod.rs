//! C4: ref-counted ownership of OS listening sockets and relay
//! registrations, shared across whichever routes currently want them.
//! Two direct listeners bound to the same `host:port` from different
//! callers share one OS socket; a relay registration for the same
//! `(relay_url, local_instance_key)` pair is likewise shared (spec §4.4).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fabric_core::{FabricError, InstanceId, SecretEncryptKey};

use crate::config::FabricConfig;
use crate::observer::Observable;
use crate::relay::{self, HandedOverConnection, RelayListenerHandle};

/// A raw TCP connection accepted on a shared direct listener, tagged with
/// the union of remote instance keys any current subscriber to that
/// `host:port` is willing to accept (spec §3, `IncomingDirect`'s
/// `allowed_keys` matching).
pub struct AcceptedDirect {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub allowed_keys: Vec<InstanceId>,
}

struct DirectEntry {
    subscribers: HashMap<InstanceId, usize>,
    cancel: Arc<tokio::sync::Notify>,
}

struct RelayEntry {
    refcount: usize,
    handle: RelayListenerHandle,
}

/// Owns every shared direct listener and relay registration, and derives
/// the debounced online-state signal from them.
pub struct IncomingMultiplexer {
    direct: DashMap<String, DirectEntry>,
    relay: DashMap<(String, InstanceId), RelayEntry>,
    accept_tx: mpsc::Sender<AcceptedDirect>,
    config: FabricConfig,
    online_observable: Arc<Observable<bool>>,
    last_online: Arc<AtomicBool>,
}

impl IncomingMultiplexer {
    #[must_use]
    pub fn new(accept_tx: mpsc::Sender<AcceptedDirect>, config: FabricConfig) -> Arc<Self> {
        let this = Arc::new(Self {
            direct: DashMap::new(),
            relay: DashMap::new(),
            accept_tx,
            config,
            online_observable: Arc::new(Observable::new()),
            last_online: Arc::new(AtomicBool::new(false)),
        });
        tokio::spawn(debounce_online_state(Arc::downgrade(&this)));
        this
    }

    #[must_use]
    pub fn online_observable(&self) -> &Arc<Observable<bool>> {
        &self.online_observable
    }

    /// Binds `host:port` if not already bound, and registers interest in
    /// connections claiming to be `remote_key`. Returns a guard that
    /// decrements the subscriber count on drop, unbinding the socket when
    /// it reaches zero.
    ///
    /// # Errors
    ///
    /// Returns [`FabricError::TransportClosed`] if the bind fails.
    pub async fn listen_for_direct_connections(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        remote_key: InstanceId,
    ) -> Result<DirectSubscription, FabricError> {
        let key = format!("{host}:{port}");
        if let Some(mut entry) = self.direct.get_mut(&key) {
            *entry.subscribers.entry(remote_key).or_insert(0) += 1;
            return Ok(DirectSubscription {
                multiplexer: Arc::downgrade(self),
                key,
                remote_key,
            });
        }

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| FabricError::TransportClosed(format!("bind {key} failed: {e}")))?;

        let cancel = Arc::new(tokio::sync::Notify::new());
        let mut subscribers = HashMap::new();
        subscribers.insert(remote_key, 1usize);
        self.direct.insert(
            key.clone(),
            DirectEntry {
                subscribers,
                cancel: Arc::clone(&cancel),
            },
        );

        tokio::spawn(accept_loop(
            listener,
            key.clone(),
            Arc::clone(self),
            self.accept_tx.clone(),
            cancel,
        ));

        Ok(DirectSubscription {
            multiplexer: Arc::downgrade(self),
            key,
            remote_key,
        })
    }

    /// Registers (or reuses) a relay registration for `local_instance_key`
    /// against `relay_url`. Returns a guard that decrements the refcount
    /// on drop, stopping the registration at zero.
    pub fn listen_for_relay_connections(
        self: &Arc<Self>,
        relay_url: String,
        local_instance_key: InstanceId,
        local_secret: Arc<SecretEncryptKey>,
        handoff_tx: mpsc::Sender<HandedOverConnection>,
    ) -> RelaySubscription {
        let table_key = (relay_url.clone(), local_instance_key);
        if let Some(mut entry) = self.relay.get_mut(&table_key) {
            entry.refcount += 1;
            return RelaySubscription {
                multiplexer: Arc::downgrade(self),
                key: table_key,
            };
        }

        let handle = relay::spawn(
            relay_url,
            local_instance_key,
            local_secret,
            self.config.clone(),
            handoff_tx,
        );
        self.relay.insert(
            table_key.clone(),
            RelayEntry {
                refcount: 1,
                handle,
            },
        );

        RelaySubscription {
            multiplexer: Arc::downgrade(self),
            key: table_key,
        }
    }

    /// "All relay listeners currently Listening" — direct listeners never
    /// affect online state (spec §4.4).
    fn compute_online_state(&self) -> bool {
        if self.relay.is_empty() {
            return false;
        }
        self.relay.iter().all(|entry| entry.handle.is_listening())
    }

    fn release_direct(&self, key: &str, remote_key: InstanceId) {
        let mut remove = false;
        if let Some(mut entry) = self.direct.get_mut(key) {
            if let Some(count) = entry.subscribers.get_mut(&remote_key) {
                *count -= 1;
                if *count == 0 {
                    entry.subscribers.remove(&remote_key);
                }
            }
            if entry.subscribers.is_empty() {
                entry.cancel.notify_waiters();
                remove = true;
            }
        }
        if remove {
            self.direct.remove(key);
        }
    }

    fn release_relay(&self, key: &(String, InstanceId)) {
        let mut remove = false;
        if let Some(mut entry) = self.relay.get_mut(key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entry.handle.stop();
                remove = true;
            }
        }
        if remove {
            self.relay.remove(key);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    key: String,
    multiplexer: Arc<IncomingMultiplexer>,
    accept_tx: mpsc::Sender<AcceptedDirect>,
    cancel: Arc<tokio::sync::Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(key = %key, error = %e, "accept failed");
                        continue;
                    }
                };
                let allowed_keys = multiplexer
                    .direct
                    .get(&key)
                    .map(|entry| entry.subscribers.keys().copied().collect())
                    .unwrap_or_default();
                if accept_tx
                    .send(AcceptedDirect { stream, addr, allowed_keys })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            () = cancel.notified() => {
                debug!(key = %key, "direct listener unbound");
                return;
            }
        }
    }
}

async fn debounce_online_state(multiplexer: Weak<IncomingMultiplexer>) {
    const DEBOUNCE: Duration = Duration::from_secs(1);
    let mut candidate: Option<(bool, Instant)> = None;

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let Some(multiplexer) = multiplexer.upgrade() else {
            return;
        };

        let computed = multiplexer.compute_online_state();
        let last = multiplexer.last_online.load(Ordering::SeqCst);

        if computed == last {
            candidate = None;
            continue;
        }

        match candidate {
            Some((value, since)) if value == computed => {
                if since.elapsed() >= DEBOUNCE {
                    multiplexer.last_online.store(computed, Ordering::SeqCst);
                    multiplexer.online_observable.emit(&computed);
                    candidate = None;
                }
            }
            _ => candidate = Some((computed, Instant::now())),
        }
    }
}

/// RAII handle to an interest in a shared direct listener.
pub struct DirectSubscription {
    multiplexer: Weak<IncomingMultiplexer>,
    key: String,
    remote_key: InstanceId,
}

impl Drop for DirectSubscription {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.release_direct(&self.key, self.remote_key);
        }
    }
}

/// RAII handle to an interest in a shared relay registration.
pub struct RelaySubscription {
    multiplexer: Weak<IncomingMultiplexer>,
    key: (String, InstanceId),
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.release_relay(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_direct_listener_reused_across_subscribers() {
        let (tx, _rx) = mpsc::channel(8);
        let mux = IncomingMultiplexer::new(tx, FabricConfig::default());

        let key_a = InstanceId([1; 32]);
        let key_b = InstanceId([2; 32]);

        let sub_a = mux
            .listen_for_direct_connections("127.0.0.1", 0, key_a)
            .await;
        // Port 0 means "any free port" from the OS's perspective, so two
        // independent binds at 0 would not collide, but real callers pass
        // an explicit port; this test only exercises bind success, not
        // sharing (sharing is exercised via explicit identical ports in
        // the route-manager integration tests).
        assert!(sub_a.is_ok());
    }

    #[test]
    fn online_state_false_without_any_relay() {
        let (tx, _rx) = mpsc::channel(8);
        let mux = IncomingMultiplexer {
            direct: DashMap::new(),
            relay: DashMap::new(),
            accept_tx: tx,
            config: FabricConfig::default(),
            online_observable: Arc::new(Observable::new()),
            last_online: Arc::new(AtomicBool::new(false)),
        };
        assert!(!mux.compute_online_state());
    }
}
