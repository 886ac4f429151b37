//! Route descriptions and the identifiers used to group and track them.
//!
//! A `Route` is a *description* of a way to reach a peer; it carries no
//! runtime state (no socket, no timer). Runtime state lives in
//! `fabric_net`'s route manager, keyed by [`GroupKey`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::InstanceId;

/// Identifies one of potentially several concurrently-known routes
/// belonging to the same connection group (spec §3, `knownRoutes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub Uuid);

impl RouteId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RouteId {
    fn default() -> Self {
        Self::new()
    }
}

/// The default connection-group name used when a caller does not specify
/// one (spec §3).
pub const DEFAULT_GROUP_NAME: &str = "default";

/// `(localInstanceKey, remoteInstanceKey, groupName)` — the key of a
/// `ConnectionGroup` (spec §3). Catch-all groups are keyed only by the
/// local instance (see [`crate::route::CatchAllKey`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub local_key: InstanceId,
    pub remote_key: InstanceId,
    pub group_name: String,
}

impl GroupKey {
    #[must_use]
    pub fn new(local_key: InstanceId, remote_key: InstanceId, group_name: impl Into<String>) -> Self {
        Self {
            local_key,
            remote_key,
            group_name: group_name.into(),
        }
    }

    #[must_use]
    pub fn with_default_group(local_key: InstanceId, remote_key: InstanceId) -> Self {
        Self::new(local_key, remote_key, DEFAULT_GROUP_NAME)
    }
}

/// Key of a `CatchAllRoutes` entry: keyed only by the local instance that
/// owns the catch-all routes (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatchAllKey {
    pub local_key: InstanceId,
}

/// A way of reaching a peer. Routes are added to a group disabled by
/// default except [`Route::IncomingRelay`] (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Route {
    /// Dial `url` and expect the peer's long-term key to be
    /// `remote_instance_key` once the handshake completes.
    OutgoingWebsocket {
        url: String,
        remote_instance_key: InstanceId,
    },
    /// Accept connections on `host:port`; only handshakes presenting a
    /// key in `allowed_keys` are accepted on this route.
    IncomingDirect {
        host: String,
        port: u16,
        allowed_keys: Vec<InstanceId>,
    },
    /// Register `local_instance_key` with the relay at `relay_url` and
    /// accept the connection handed over after a peer rendezvous there.
    IncomingRelay {
        relay_url: String,
        local_instance_key: InstanceId,
    },
}

impl Route {
    /// Whether this route is enabled by default when first added (spec
    /// §4.6): only incoming relay routes start enabled.
    #[must_use]
    pub fn enabled_by_default(&self) -> bool {
        matches!(self, Route::IncomingRelay { .. })
    }
}

/// A known route entry within a connection group: the route description
/// plus its enabled/disabled toggle (spec §3, `knownRoutes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownRoute {
    pub id: RouteId,
    pub route: Route,
    pub disabled: bool,
}

impl KnownRoute {
    #[must_use]
    pub fn new(route: Route) -> Self {
        let disabled = !route.enabled_by_default();
        Self {
            id: RouteId::new(),
            route,
            disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_routes_enabled_by_default_others_not() {
        let relay = Route::IncomingRelay {
            relay_url: "wss://relay.example".into(),
            local_instance_key: InstanceId([1; 32]),
        };
        assert!(!KnownRoute::new(relay).disabled);

        let outgoing = Route::OutgoingWebsocket {
            url: "wss://peer.example".into(),
            remote_instance_key: InstanceId([2; 32]),
        };
        assert!(KnownRoute::new(outgoing).disabled);

        let direct = Route::IncomingDirect {
            host: "0.0.0.0".into(),
            port: 9001,
            allowed_keys: vec![InstanceId([3; 32])],
        };
        assert!(KnownRoute::new(direct).disabled);
    }

    #[test]
    fn group_key_with_default_group_uses_default_name() {
        let key = GroupKey::with_default_group(InstanceId([1; 32]), InstanceId([2; 32]));
        assert_eq!(key.group_name, DEFAULT_GROUP_NAME);
    }
}
