//! Shared types for the connection fabric: identities, key material, wire
//! envelopes, route descriptions, and the closed error taxonomy that
//! `fabric-net`'s components operate over.
//!
//! This crate owns no runtime behavior — no sockets, no timers, no task
//! spawning. It is the vocabulary `fabric-net` is built from.

pub mod crypto;
pub mod errors;
pub mod identity;
pub mod keystore;
pub mod route;
pub mod wire;

pub use crypto::{
    bit_invert, constant_time_eq, make_challenge, open_sealed, seal, EphemeralKeyPair,
    PublicEncryptKey, PublicSignKey, SealedBox, SecretEncryptKey, CHALLENGE_LEN,
};
pub use errors::FabricError;
pub use identity::{InstanceId, Keys, KeysOwner, LocalInstanceEntry, LocalInstancesList, PersonId};
pub use keystore::{InMemoryKeyStore, KeyStore};
pub use route::{CatchAllKey, GroupKey, KnownRoute, Route, RouteId, DEFAULT_GROUP_NAME};
pub use wire::{HandshakeMessage, RelayMessage};
