//! JSON wire envelopes for the relay protocol (spec §4.3, §6) and the
//! handshake protocol (spec §4.5, §6).
//!
//! Every control message is a JSON object carrying a `command` field; this
//! module models that as a single tagged enum per protocol so that
//! `serde_json` does the framing/dispatch work the teacher's handlers do
//! by hand with raw `Value`s. Binary payloads (the two challenge/response
//! frames per handshake direction) are sent as separate raw frames, not
//! JSON, and are therefore not represented here — callers send/receive
//! them as plain `Vec<u8>` through the framed connection.

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicEncryptKey, SealedBox};
use crate::identity::{InstanceId, Keys, PersonId};

/// Messages exchanged between a relay listener registration and the relay
/// server, in the order given by spec §4.3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Listener → relay: register a public key to listen for incoming
    /// rendezvous on.
    Register {
        #[serde(rename = "publicKey", with = "hex_key")]
        public_key: InstanceId,
    },
    /// Relay → listener: prove possession of the registered key.
    AuthenticationRequest {
        challenge: String, // base64, per spec §6
        #[serde(rename = "publicKey")]
        public_key: PublicEncryptKey, // relay's ephemeral key, hex per spec; base64-encoded here as elsewhere
    },
    /// Listener → relay: the bit-inverted, re-encrypted challenge.
    AuthenticationResponse { response: String }, // base64
    /// Relay → listener: the socket is now a raw peer connection.
    ConnectionHandover,
    /// Listener → relay keepalive ping.
    CommPing,
    /// Relay → listener keepalive pong.
    CommPong,
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::identity::InstanceId;

    pub fn serialize<S: Serializer>(id: &InstanceId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(id.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<InstanceId, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("wrong key length"))?;
        Ok(InstanceId(array))
    }
}

/// Messages exchanged directly between two peers once a raw framed
/// connection exists, before the Encryption plugin is installed (spec
/// §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Step (a): announce long-term keys and request a session.
    CommunicationRequest {
        source_public_key: InstanceId,
        target_public_key: InstanceId,
    },
    /// Step (a): acceptor's verdict on whether `target_public_key` is
    /// allowed.
    CommunicationReady { ready: bool },
    /// Step (a): an ephemeral public key, sealed under the peer's
    /// long-term key.
    TemporaryKeys { sealed_ephemeral: SealedBox },
    /// Step (b): the initiator's proposed connection-group name; echoed
    /// or substituted by the acceptor (initiator wins, spec §4.5(b)).
    ConnectionGroupName { name: String },
    /// Step (c): one-byte sync barrier token, sent both ways.
    Synchronisation { token: u8 },
    /// Step (d): a `Keys` object for the sender's `PersonId`.
    KeysObject { keys: Keys },
    /// Step (d): the sender's `PersonId`, announced before the challenge
    /// round for that side begins.
    PersonIdObject { person_id: PersonId },
}
