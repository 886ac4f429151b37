//! C6: the route manager, the top-level owner of every connection group
//! and catch-all route for one local instance (spec §4.6). Ties together
//! the dialer (C7), the incoming multiplexer (C4), and the handshake
//! (C5): routes describe *how* to reach a peer, the manager decides
//! *when* to use them and what to do when a resulting connection closes.
//!
//! Grounded on the teacher's `ShutdownController` (`network/shutdown.rs`)
//! for the manager's own lifecycle — a `watch`-based shutdown signal
//! broadcast to every background task — generalized from HTTP health
//! states to "stop dialing, stop listening, close everything".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use fabric_core::{
    FabricError, GroupKey, InstanceId, Keys, KeyStore, KnownRoute, PersonId, Route, RouteId,
    SecretEncryptKey,
};

use crate::config::{jittered, FabricConfig};
use crate::dialer::Dialer;
use crate::framed::FramedConnection;
use crate::handshake::keyring::LongTermKeyring;
use crate::handshake::{self, HandshakeInput, HandshakeOptions, HandshakeOutcome, Role};
use crate::multiplexer::{AcceptedDirect, DirectSubscription, IncomingMultiplexer, RelaySubscription};
use crate::observer::Observable;
use crate::relay::HandedOverConnection;

/// Emitted whenever a connection group becomes active or goes idle (spec
/// §9 Design Notes' unified observer point for connection lifecycle).
#[derive(Debug, Clone)]
pub struct GroupEvent {
    pub group_key: GroupKey,
    pub kind: GroupEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEventKind {
    Connected,
    Disconnected,
}

/// Tri-optional filter over connection groups, used by `enable_routes`,
/// `disable_routes`, and `close_connections` (spec §4.6). `None` fields
/// match every value.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub local_key: Option<InstanceId>,
    pub remote_key: Option<InstanceId>,
    pub group_name: Option<String>,
}

impl RouteFilter {
    fn matches(&self, key: &GroupKey) -> bool {
        if let Some(local) = self.local_key {
            if local != key.local_key {
                return false;
            }
        }
        if let Some(remote) = self.remote_key {
            if remote != key.remote_key {
                return false;
            }
        }
        if let Some(name) = &self.group_name {
            if name != &key.group_name {
                return false;
            }
        }
        true
    }
}

enum GroupState {
    Idle,
    Active {
        conn: Arc<FramedConnection>,
        assigned_at: Instant,
    },
}

/// Runtime state for one `(local, remote, group_name)` triple: its known
/// routes plus whatever dialers/subscriptions are currently driving them.
///
/// `ephemeral` groups are created on the fly when a catch-all route
/// accepts a peer with no explicitly configured routes of its own; they
/// are deleted entirely once their connection closes (spec §4.6). A group
/// created by an explicit `add_*_route` call is never ephemeral, even if
/// a catch-all route happened to win the race to accept it first.
struct ConnectionGroup {
    routes: Vec<KnownRoute>,
    state: GroupState,
    ephemeral: bool,
    dialers: HashMap<RouteId, Dialer>,
    direct_subs: HashMap<RouteId, DirectSubscription>,
    relay_subs: HashMap<RouteId, RelaySubscription>,
}

impl ConnectionGroup {
    fn new(ephemeral: bool) -> Self {
        Self {
            routes: Vec::new(),
            state: GroupState::Idle,
            ephemeral,
            dialers: HashMap::new(),
            direct_subs: HashMap::new(),
            relay_subs: HashMap::new(),
        }
    }
}

/// Owns every connection group and catch-all route for one local
/// instance, and the background tasks that accept connections on their
/// behalf.
pub struct RouteManager {
    local_instance_key: InstanceId,
    local_person_id: PersonId,
    local_keys: Keys,
    local_secret: Arc<SecretEncryptKey>,
    keyring: Arc<dyn LongTermKeyring>,
    keystore: Arc<dyn KeyStore>,
    config: FabricConfig,
    multiplexer: Arc<IncomingMultiplexer>,
    groups: DashMap<GroupKey, Arc<AsyncMutex<ConnectionGroup>>>,
    catch_all_routes: AsyncMutex<Vec<KnownRoute>>,
    catch_all_relay_subs: AsyncMutex<HashMap<RouteId, RelaySubscription>>,
    catch_all_direct_cancel: AsyncMutex<HashMap<RouteId, Arc<Notify>>>,
    relay_handoff_tx: mpsc::Sender<HandedOverConnection>,
    shutdown_tx: watch::Sender<bool>,
    events: Arc<Observable<GroupEvent>>,
}

impl RouteManager {
    #[must_use]
    pub fn new(
        local_instance_key: InstanceId,
        local_person_id: PersonId,
        local_keys: Keys,
        local_secret: Arc<SecretEncryptKey>,
        keyring: Arc<dyn LongTermKeyring>,
        keystore: Arc<dyn KeyStore>,
        config: FabricConfig,
    ) -> Arc<Self> {
        let (direct_tx, direct_rx) = mpsc::channel(64);
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let multiplexer = IncomingMultiplexer::new(direct_tx, config.clone());
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            local_instance_key,
            local_person_id,
            local_keys,
            local_secret,
            keyring,
            keystore,
            config,
            multiplexer,
            groups: DashMap::new(),
            catch_all_routes: AsyncMutex::new(Vec::new()),
            catch_all_relay_subs: AsyncMutex::new(HashMap::new()),
            catch_all_direct_cancel: AsyncMutex::new(HashMap::new()),
            relay_handoff_tx: relay_tx,
            shutdown_tx,
            events: Arc::new(Observable::new()),
        });

        tokio::spawn(accept_direct_loop(Arc::clone(&manager), direct_rx));
        tokio::spawn(accept_relay_loop(Arc::clone(&manager), relay_rx));

        manager
    }

    #[must_use]
    pub fn local_instance_key(&self) -> InstanceId {
        self.local_instance_key
    }

    #[must_use]
    pub fn events(&self) -> &Arc<Observable<GroupEvent>> {
        &self.events
    }

    #[must_use]
    pub fn online_observable(&self) -> &Arc<Observable<bool>> {
        self.multiplexer.online_observable()
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn get_or_create_group(&self, key: GroupKey, ephemeral_if_new: bool) -> Arc<AsyncMutex<ConnectionGroup>> {
        let entry = self
            .groups
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(ConnectionGroup::new(ephemeral_if_new))));
        Arc::clone(&entry)
    }

    /// Adds a disabled-by-default outgoing route to `group_key`'s known
    /// routes (spec §4.6). Call [`Self::enable_routes`] to start dialing.
    pub async fn add_outgoing_websocket_route(self: &Arc<Self>, group_key: GroupKey, url: String) -> RouteId {
        let group_arc = self.get_or_create_group(group_key.clone(), false);
        let mut group = group_arc.lock().await;
        group.ephemeral = false;
        let route = Route::OutgoingWebsocket {
            url,
            remote_instance_key: group_key.remote_key,
        };
        let known = KnownRoute::new(route);
        let id = known.id;
        group.routes.push(known);
        id
    }

    /// Adds a disabled-by-default direct-listen route, accepting only
    /// `group_key.remote_key` once enabled.
    pub async fn add_incoming_direct_route(
        self: &Arc<Self>,
        group_key: GroupKey,
        host: String,
        port: u16,
    ) -> RouteId {
        let group_arc = self.get_or_create_group(group_key.clone(), false);
        let mut group = group_arc.lock().await;
        group.ephemeral = false;
        let route = Route::IncomingDirect {
            host,
            port,
            allowed_keys: vec![group_key.remote_key],
        };
        let known = KnownRoute::new(route);
        let id = known.id;
        group.routes.push(known);
        id
    }

    /// Adds an incoming relay route, enabled by default (spec §4.6): the
    /// registration with `relay_url` starts immediately.
    pub async fn add_incoming_relay_route(self: &Arc<Self>, group_key: GroupKey, relay_url: String) -> RouteId {
        let group_arc = self.get_or_create_group(group_key.clone(), false);
        let mut group = group_arc.lock().await;
        group.ephemeral = false;
        let route = Route::IncomingRelay {
            relay_url,
            local_instance_key: group_key.local_key,
        };
        let known = KnownRoute::new(route.clone());
        let id = known.id;
        let enabled = !known.disabled;
        group.routes.push(known);
        if enabled {
            self.start_route(&group_key, id, &route, &mut group).await;
        }
        id
    }

    /// Adds a disabled-by-default catch-all direct listener: once
    /// enabled, any peer completing the handshake is accepted regardless
    /// of instance key, and a fresh group is created for it on the fly.
    pub async fn add_catch_all_direct_route(self: &Arc<Self>, host: String, port: u16) -> RouteId {
        let route = Route::IncomingDirect {
            host,
            port,
            allowed_keys: Vec::new(),
        };
        let known = KnownRoute::new(route);
        let id = known.id;
        self.catch_all_routes.lock().await.push(known);
        id
    }

    /// Adds a catch-all relay route, enabled by default: registers with
    /// `relay_url` immediately and accepts any peer handed over there.
    pub async fn add_catch_all_relay_route(self: &Arc<Self>, relay_url: String) -> RouteId {
        let route = Route::IncomingRelay {
            relay_url,
            local_instance_key: self.local_instance_key,
        };
        let known = KnownRoute::new(route.clone());
        let id = known.id;
        let enabled = !known.disabled;
        self.catch_all_routes.lock().await.push(known);
        if enabled {
            self.start_catch_all_route(id, &route).await;
        }
        id
    }

    /// Enables every route matching `filter`, starting whatever dialing
    /// or listening it requires.
    pub async fn enable_routes(self: &Arc<Self>, filter: RouteFilter) {
        self.set_routes_enabled(filter, true).await;
    }

    /// Disables every route matching `filter`, stopping its dialer or
    /// listener subscription without touching any already-active
    /// connection.
    pub async fn disable_routes(self: &Arc<Self>, filter: RouteFilter) {
        self.set_routes_enabled(filter, false).await;
    }

    async fn set_routes_enabled(self: &Arc<Self>, filter: RouteFilter, enable: bool) {
        let keys: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|e| filter.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            let Some(group_arc) = self.groups.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let mut group = group_arc.lock().await;
            let route_snapshot: Vec<(RouteId, Route)> =
                group.routes.iter().map(|r| (r.id, r.route.clone())).collect();
            for route in &mut group.routes {
                route.disabled = !enable;
            }

            if enable {
                for (route_id, route) in route_snapshot {
                    self.start_route(&key, route_id, &route, &mut group).await;
                }
            } else {
                let ids: Vec<RouteId> = group.routes.iter().map(|r| r.id).collect();
                for id in ids {
                    stop_route(id, &mut group);
                }
            }
        }

        if filter.local_key.is_none() || filter.local_key == Some(self.local_instance_key) {
            let routes_snapshot: Vec<(RouteId, Route)> = {
                let mut catch_all = self.catch_all_routes.lock().await;
                for route in catch_all.iter_mut() {
                    route.disabled = !enable;
                }
                catch_all.iter().map(|r| (r.id, r.route.clone())).collect()
            };
            for (route_id, route) in routes_snapshot {
                if enable {
                    self.start_catch_all_route(route_id, &route).await;
                } else {
                    self.stop_catch_all_route(route_id).await;
                }
            }
        }
    }

    /// Force-closes every active connection in a group matching `filter`.
    /// Reconnect scheduling (for outgoing routes) runs exactly as it
    /// would for a connection that closed on its own.
    pub async fn close_connections(&self, filter: RouteFilter) {
        let keys: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|e| filter.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            let Some(group_arc) = self.groups.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let group = group_arc.lock().await;
            if let GroupState::Active { conn, .. } = &group.state {
                conn.close(Some(FabricError::Cancelled));
            }
        }
    }

    /// Stops every dialer and listener, closes every active connection,
    /// and signals shutdown to anything watching [`Self::shutdown_receiver`].
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        self.disable_routes(RouteFilter::default()).await;
        self.close_connections(RouteFilter::default()).await;

        let mut direct_cancels = self.catch_all_direct_cancel.lock().await;
        for (_, cancel) in direct_cancels.drain() {
            cancel.notify_waiters();
        }
        drop(direct_cancels);
        self.catch_all_relay_subs.lock().await.clear();
    }

    async fn start_route(
        self: &Arc<Self>,
        group_key: &GroupKey,
        route_id: RouteId,
        route: &Route,
        group: &mut ConnectionGroup,
    ) {
        match route {
            Route::OutgoingWebsocket { url, .. } => {
                if group.dialers.contains_key(&route_id) {
                    return;
                }
                let manager = Arc::clone(self);
                let gk = group_key.clone();
                let dialer = Dialer::start(url.clone(), self.config.clone(), move |conn| {
                    let manager = Arc::clone(&manager);
                    let gk = gk.clone();
                    tokio::spawn(async move {
                        manager.run_initiator_handshake(gk, conn).await;
                    });
                });
                group.dialers.insert(route_id, dialer);
            }
            Route::IncomingDirect { host, port, .. } => {
                if group.direct_subs.contains_key(&route_id) {
                    return;
                }
                match self
                    .multiplexer
                    .listen_for_direct_connections(host, *port, group_key.remote_key)
                    .await
                {
                    Ok(sub) => {
                        group.direct_subs.insert(route_id, sub);
                    }
                    Err(e) => warn!(host = %host, port = %port, error = %e, "direct listen failed"),
                }
            }
            Route::IncomingRelay {
                relay_url,
                local_instance_key,
            } => {
                if group.relay_subs.contains_key(&route_id) {
                    return;
                }
                let sub = self.multiplexer.listen_for_relay_connections(
                    relay_url.clone(),
                    *local_instance_key,
                    Arc::clone(&self.local_secret),
                    self.relay_handoff_tx.clone(),
                );
                group.relay_subs.insert(route_id, sub);
            }
        }
    }

    async fn start_catch_all_route(self: &Arc<Self>, route_id: RouteId, route: &Route) {
        match route {
            Route::IncomingRelay {
                relay_url,
                local_instance_key,
            } => {
                let sub = self.multiplexer.listen_for_relay_connections(
                    relay_url.clone(),
                    *local_instance_key,
                    Arc::clone(&self.local_secret),
                    self.relay_handoff_tx.clone(),
                );
                self.catch_all_relay_subs.lock().await.insert(route_id, sub);
            }
            Route::IncomingDirect { host, port, .. } => {
                match TcpListener::bind((host.as_str(), *port)).await {
                    Ok(listener) => {
                        let cancel = Arc::new(Notify::new());
                        self.catch_all_direct_cancel
                            .lock()
                            .await
                            .insert(route_id, Arc::clone(&cancel));
                        let manager = Arc::clone(self);
                        tokio::spawn(catch_all_direct_accept_loop(manager, listener, cancel));
                    }
                    Err(e) => warn!(host = %host, port = %port, error = %e, "catch-all direct bind failed"),
                }
            }
            Route::OutgoingWebsocket { .. } => {
                warn!("internal invariant violated: outgoing route in catch-all list, ignoring");
            }
        }
    }

    async fn stop_catch_all_route(&self, route_id: RouteId) {
        self.catch_all_relay_subs.lock().await.remove(&route_id);
        if let Some(cancel) = self.catch_all_direct_cancel.lock().await.remove(&route_id) {
            cancel.notify_waiters();
        }
    }

    async fn run_initiator_handshake(self: Arc<Self>, group_key: GroupKey, conn: FramedConnection) {
        let input = HandshakeInput {
            role: Role::Initiator,
            local_instance_key: self.local_instance_key,
            remote_instance_key: Some(group_key.remote_key),
            allowed_instance_keys: Vec::new(),
            accept_any: false,
            proposed_group_name: Some(group_key.group_name.clone()),
            local_person_id: self.local_person_id,
            local_keys: self.local_keys.clone(),
            keyring: self.keyring.as_ref(),
            keystore: self.keystore.as_ref(),
            options: HandshakeOptions {
                timeout: self.config.handshake_timeout,
                ..HandshakeOptions::default()
            },
        };
        match handshake::run(&conn, input).await {
            Ok(outcome) => self.on_handshake_success(conn, outcome).await,
            Err(e) => {
                debug!(remote = %group_key.remote_key, error = %e, "initiator handshake failed");
                metrics::counter!("fabric_handshake_failures_total").increment(1);
                conn.close(Some(e));
            }
        }
    }

    async fn run_acceptor_handshake(
        self: Arc<Self>,
        conn: FramedConnection,
        allowed_instance_keys: Vec<InstanceId>,
        accept_any: bool,
    ) {
        let input = HandshakeInput {
            role: Role::Acceptor,
            local_instance_key: self.local_instance_key,
            remote_instance_key: None,
            allowed_instance_keys,
            accept_any,
            proposed_group_name: None,
            local_person_id: self.local_person_id,
            local_keys: self.local_keys.clone(),
            keyring: self.keyring.as_ref(),
            keystore: self.keystore.as_ref(),
            options: HandshakeOptions {
                timeout: self.config.handshake_timeout,
                ..HandshakeOptions::default()
            },
        };
        match handshake::run(&conn, input).await {
            Ok(outcome) => self.on_handshake_success(conn, outcome).await,
            Err(e) => {
                debug!(error = %e, "acceptor handshake failed");
                metrics::counter!("fabric_handshake_failures_total").increment(1);
                conn.close(Some(e));
            }
        }
    }

    async fn on_handshake_success(self: Arc<Self>, conn: FramedConnection, outcome: HandshakeOutcome) {
        let group_key = GroupKey::new(
            self.local_instance_key,
            outcome.remote_instance_key,
            outcome.group_name.clone(),
        );
        let is_new_group = !self.groups.contains_key(&group_key);
        let group_arc = self.get_or_create_group(group_key.clone(), is_new_group);

        info!(
            remote = %outcome.remote_instance_key,
            group = %group_key.group_name,
            new_person = outcome.is_new_person,
            "handshake completed"
        );

        self.assign_connection(group_arc, group_key, conn).await;
    }

    async fn assign_connection(
        self: Arc<Self>,
        group_arc: Arc<AsyncMutex<ConnectionGroup>>,
        group_key: GroupKey,
        conn: FramedConnection,
    ) {
        let conn = Arc::new(conn);
        let mut group = group_arc.lock().await;
        if let GroupState::Active {
            conn: existing,
            assigned_at,
        } = &group.state
        {
            if assigned_at.elapsed() < self.config.drop_duplicate_window {
                drop(group);
                conn.close(Some(FabricError::DuplicateDropped));
                debug!(remote = %group_key.remote_key, "dropped duplicate connection within window");
                return;
            }
            existing.close(Some(FabricError::TransportClosed("superseded by new connection".into())));
        }
        group.state = GroupState::Active {
            conn: Arc::clone(&conn),
            assigned_at: Instant::now(),
        };
        drop(group);
        metrics::gauge!("fabric_connections_active").increment(1.0);

        self.events.emit(&GroupEvent {
            group_key: group_key.clone(),
            kind: GroupEventKind::Connected,
        });

        let manager = Arc::clone(&self);
        let key = group_key.clone();
        let watched_conn = Arc::clone(&conn);
        let watched_group = Arc::clone(&group_arc);
        tokio::spawn(async move {
            watched_conn.wait_closed().await;
            manager.handle_group_closed(key, watched_group, watched_conn).await;
        });
    }

    /// Fires once a connection this manager assigned has closed. `closed_conn`
    /// identifies which connection the firing watcher was tracking; since
    /// `assign_connection` supersedes rather than cancels an old watcher when
    /// a new connection takes over a group, a watcher can fire long after its
    /// connection stopped being the group's active one. Comparing against the
    /// group's current `conn` by pointer makes that case a no-op instead of
    /// corrupting state a newer connection already owns (spec §4.6 step 7).
    async fn handle_group_closed(
        self: Arc<Self>,
        group_key: GroupKey,
        group_arc: Arc<AsyncMutex<ConnectionGroup>>,
        closed_conn: Arc<FramedConnection>,
    ) {
        let mut group = group_arc.lock().await;
        let is_current_conn = matches!(
            &group.state,
            GroupState::Active { conn, .. } if Arc::ptr_eq(conn, &closed_conn)
        );
        if !is_current_conn {
            return;
        }
        group.state = GroupState::Idle;

        metrics::gauge!("fabric_connections_active").decrement(1.0);
        self.events.emit(&GroupEvent {
            group_key: group_key.clone(),
            kind: GroupEventKind::Disconnected,
        });

        if group.ephemeral && group.routes.is_empty() {
            drop(group);
            self.groups.remove(&group_key);
            debug!(remote = %group_key.remote_key, "catch-all group deleted after close");
            return;
        }

        let route_ids: Vec<(RouteId, Route)> = group
            .routes
            .iter()
            .filter(|r| !r.disabled && matches!(r.route, Route::OutgoingWebsocket { .. }))
            .map(|r| (r.id, r.route.clone()))
            .collect();
        drop(group);

        if route_ids.is_empty() {
            return;
        }

        let delay = jittered(self.config.reconnect_delay_on_close);
        tokio::time::sleep(delay).await;

        let mut group = group_arc.lock().await;
        if matches!(group.state, GroupState::Idle) {
            for (route_id, route) in route_ids {
                self.start_route(&group_key, route_id, &route, &mut group).await;
            }
        }
    }

    /// Returns the instance keys this local instance should accept on
    /// `relay_url`, plus whether a catch-all relay route also applies.
    /// Mirrors the multiplexer's "union of subscribers" rule for direct
    /// listeners (spec §4.4), since a relay registration is likewise
    /// shared across every group that names it.
    async fn allowed_relay_keys(&self, relay_url: &str) -> (Vec<InstanceId>, bool) {
        let candidates: Vec<(InstanceId, Arc<AsyncMutex<ConnectionGroup>>)> = self
            .groups
            .iter()
            .filter(|e| e.key().local_key == self.local_instance_key)
            .map(|e| (e.key().remote_key, Arc::clone(e.value())))
            .collect();

        let mut allowed = Vec::new();
        for (remote_key, group_arc) in candidates {
            let group = group_arc.lock().await;
            let has_route = group.routes.iter().any(|r| {
                !r.disabled
                    && matches!(&r.route, Route::IncomingRelay { relay_url: u, .. } if u == relay_url)
            });
            if has_route {
                allowed.push(remote_key);
            }
        }

        let catch_all = self.catch_all_routes.lock().await;
        let accept_any = catch_all.iter().any(|r| {
            !r.disabled && matches!(&r.route, Route::IncomingRelay { relay_url: u, .. } if u == relay_url)
        });

        (allowed, accept_any)
    }

    async fn handle_accepted_direct(self: Arc<Self>, accepted: AcceptedDirect) {
        let ws = match accept_async(accepted.stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(addr = %accepted.addr, error = %e, "websocket upgrade failed");
                return;
            }
        };
        let conn = FramedConnection::spawn(
            ws,
            self.config.max_frame_size,
            self.config.keepalive_interval,
            self.config.keepalive_missed_limit,
        );
        let accept_any = accepted.allowed_keys.is_empty();
        self.run_acceptor_handshake(conn, accepted.allowed_keys, accept_any).await;
    }

    async fn handle_handed_over(self: Arc<Self>, handed_over: HandedOverConnection) {
        let (allowed, accept_any) = self.allowed_relay_keys(&handed_over.relay_url).await;
        self.run_acceptor_handshake(handed_over.conn, allowed, accept_any).await;
    }

    async fn handle_accepted_catch_all_direct(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(addr = %addr, error = %e, "catch-all websocket upgrade failed");
                return;
            }
        };
        let conn = FramedConnection::spawn(
            ws,
            self.config.max_frame_size,
            self.config.keepalive_interval,
            self.config.keepalive_missed_limit,
        );
        self.run_acceptor_handshake(conn, Vec::new(), true).await;
    }
}

fn stop_route(route_id: RouteId, group: &mut ConnectionGroup) {
    if let Some(dialer) = group.dialers.remove(&route_id) {
        dialer.stop();
    }
    group.direct_subs.remove(&route_id);
    group.relay_subs.remove(&route_id);
}

async fn accept_direct_loop(manager: Arc<RouteManager>, mut rx: mpsc::Receiver<AcceptedDirect>) {
    while let Some(accepted) = rx.recv().await {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.handle_accepted_direct(accepted).await;
        });
    }
}

async fn accept_relay_loop(manager: Arc<RouteManager>, mut rx: mpsc::Receiver<HandedOverConnection>) {
    while let Some(handed_over) = rx.recv().await {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.handle_handed_over(handed_over).await;
        });
    }
}

async fn catch_all_direct_accept_loop(manager: Arc<RouteManager>, listener: TcpListener, cancel: Arc<Notify>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "catch-all accept failed");
                        continue;
                    }
                };
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.handle_accepted_catch_all_direct(stream, addr).await;
                });
            }
            () = cancel.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::keyring::InMemoryKeyring;
    use fabric_core::{InMemoryKeyStore, KeysOwner, PublicSignKey};
    use std::time::Duration;

    #[test]
    fn route_filter_matches_on_specified_fields_only() {
        let key = GroupKey::with_default_group(InstanceId([1; 32]), InstanceId([2; 32]));
        assert!(RouteFilter::default().matches(&key));

        let by_remote = RouteFilter {
            remote_key: Some(InstanceId([2; 32])),
            ..RouteFilter::default()
        };
        assert!(by_remote.matches(&key));

        let wrong_remote = RouteFilter {
            remote_key: Some(InstanceId([9; 32])),
            ..RouteFilter::default()
        };
        assert!(!wrong_remote.matches(&key));
    }

    #[test]
    fn connection_group_starts_idle_and_not_ephemeral() {
        let group = ConnectionGroup::new(false);
        assert!(matches!(group.state, GroupState::Idle));
        assert!(!group.ephemeral);
        assert!(group.routes.is_empty());
    }

    struct LocalIdentity {
        instance: InstanceId,
        person: PersonId,
        keys: Keys,
        keyring: InMemoryKeyring,
    }

    fn local_identity() -> LocalIdentity {
        let instance_secret = SecretEncryptKey::generate();
        let person_secret = SecretEncryptKey::generate();
        let instance = InstanceId(instance_secret.public_key().0);
        let person = PersonId(person_secret.public_key().0);
        let mut sign_key_bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::rng(), &mut sign_key_bytes);
        let keys = Keys {
            owner: KeysOwner::Person(person),
            public_encryption_key: person_secret.public_key(),
            public_sign_key: PublicSignKey(sign_key_bytes),
        };
        let mut keyring = InMemoryKeyring::new();
        keyring.add_instance_secret(instance, instance_secret);
        keyring.add_person_secret(person, person_secret);
        LocalIdentity {
            instance,
            person,
            keys,
            keyring,
        }
    }

    #[tokio::test]
    async fn direct_dial_happy_path_establishes_group() {
        crate::test_support::init_test_tracing();

        let a = local_identity();
        let b = local_identity();

        let config = FabricConfig {
            handshake_timeout: Duration::from_secs(5),
            reconnect_interval_on_failure: Duration::from_millis(50),
            ..FabricConfig::default()
        };

        let manager_a = RouteManager::new(
            a.instance,
            a.person,
            a.keys,
            Arc::new(SecretEncryptKey::generate()),
            Arc::new(a.keyring),
            Arc::new(InMemoryKeyStore::new()),
            config.clone(),
        );
        let manager_b = RouteManager::new(
            b.instance,
            b.person,
            b.keys,
            Arc::new(SecretEncryptKey::generate()),
            Arc::new(b.keyring),
            Arc::new(InMemoryKeyStore::new()),
            config.clone(),
        );

        let group_key_b_side = GroupKey::with_default_group(b.instance, a.instance);
        manager_b
            .add_incoming_direct_route(group_key_b_side.clone(), "127.0.0.1".to_string(), 18765)
            .await;
        manager_b.enable_routes(RouteFilter::default()).await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let group_key_a_side = GroupKey::with_default_group(a.instance, b.instance);
        manager_a
            .add_outgoing_websocket_route(group_key_a_side.clone(), "ws://127.0.0.1:18765".to_string())
            .await;
        manager_a.enable_routes(RouteFilter::default()).await;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(entry) = manager_a.groups.get(&group_key_a_side) {
                let group = Arc::clone(entry.value());
                drop(entry);
                let guard = group.lock().await;
                if matches!(guard.state, GroupState::Active { .. }) {
                    return;
                }
            }
        }
        panic!("direct connection did not become active within timeout");
    }
}
