//! Cryptographic primitives underlying the handshake and relay protocols.
//!
//! Two asymmetric primitives are used throughout the connection fabric:
//! - X25519 for both long-term and ephemeral encryption keys, combined with
//!   `ChaCha20Poly1305` for the "encrypt under a public key" operation used
//!   by the relay challenge and the handshake's person-key challenge.
//! - Ed25519 for the public signing key pinned to a `Keys` object. No
//!   signature sub-protocol is specified by this layer (spec §4.5 only
//!   exchanges the verifying key); verification is left to callers that
//!   need it.
//!
//! Session traffic after the handshake uses `ChaCha20Poly1305` directly
//! with a per-direction nonce counter (see `fabric_net`'s encryption
//! plugin) rather than the sealed-box scheme here, which is only used for
//! the one-shot messages exchanged before a session key exists.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::errors::FabricError;

/// Length in bytes of the random challenge used in both the relay
/// registration handshake and the person-key challenge–response (spec §4.3,
/// §4.5(d)).
pub const CHALLENGE_LEN: usize = 64;

fn b64_serialize<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn b64_deserialize<'de, D: serde::Deserializer<'de>, const N: usize>(
    d: D,
) -> Result<[u8; N], D::Error> {
    use base64::Engine;
    let s = String::deserialize(d)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.as_bytes())
        .map_err(serde::de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom("wrong key length"))
}

/// A long-term or ephemeral X25519 public encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicEncryptKey(pub [u8; 32]);

impl PublicEncryptKey {
    #[must_use]
    pub fn from_dalek(pk: &PublicKey) -> Self {
        Self(*pk.as_bytes())
    }

    #[must_use]
    pub fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl Serialize for PublicEncryptKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        b64_serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for PublicEncryptKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Self(b64_deserialize::<D, 32>(d)?))
    }
}

/// An Ed25519 public signing key, pinned to a `Keys` object but not
/// otherwise exercised by this layer (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicSignKey(pub [u8; 32]);

impl Serialize for PublicSignKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        b64_serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for PublicSignKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes = b64_deserialize::<D, 32>(d)?;
        // Reject malformed curve points up front rather than accepting
        // bytes that would only fail later, at signature-verification time.
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|_| serde::de::Error::custom("invalid ed25519 verifying key"))?;
        Ok(Self(bytes))
    }
}

impl PublicSignKey {
    #[must_use]
    pub fn to_dalek(self) -> ed25519_dalek::VerifyingKey {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .expect("validated on construction/deserialization")
    }
}

/// Long-term or ephemeral X25519 secret key, kept only in memory by the
/// key keychain collaborator. The core never persists private key
/// material (spec §5, "Shared-resource policy").
pub struct SecretEncryptKey(StaticSecret);

impl SecretEncryptKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey::from_dalek(&PublicKey::from(&self.0))
    }
}

/// Output of sealing a plaintext under a recipient's public key: a
/// fresh one-shot ephemeral public key, a nonce, and the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    pub ephemeral_public: PublicEncryptKey,
    #[serde(serialize_with = "b64_serialize", deserialize_with = "nonce_de")]
    pub nonce: [u8; 12],
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

fn nonce_de<'de, D: serde::Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
    b64_deserialize::<D, 12>(d)
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn kdf(shared_secret: &[u8; 32], salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Encrypts `plaintext` so that only the holder of `recipient_secret`
/// matching `recipient_pub` can recover it ("encrypt under the peer's
/// long-term key" throughout spec §4.5 and §4.3).
///
/// # Errors
///
/// Returns [`FabricError::DecryptionFailed`] only in the symmetric
/// `open_sealed` direction; this function does not fail.
#[must_use]
pub fn seal(recipient_pub: &PublicEncryptKey, plaintext: &[u8]) -> SealedBox {
    let ephemeral = SecretEncryptKey::generate();
    let shared = ephemeral.0.diffie_hellman(&recipient_pub.to_dalek());
    let key_bytes = kdf(shared.as_bytes(), b"fabric-seal");
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // ChaCha20Poly1305 only fails on (practically unreachable) length
    // limits; a fresh nonce + small plaintext never hits them.
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("sealing with a fresh nonce cannot fail");

    SealedBox {
        ephemeral_public: ephemeral.public_key(),
        nonce: nonce_bytes,
        ciphertext,
    }
}

/// Opens a [`SealedBox`] previously produced by [`seal`] for `recipient_pub`.
///
/// # Errors
///
/// Returns [`FabricError::DecryptionFailed`] if authentication fails (wrong
/// key, corrupted ciphertext, or replay with a tampered nonce).
pub fn open_sealed(
    recipient_secret: &SecretEncryptKey,
    sealed: &SealedBox,
) -> Result<Vec<u8>, FabricError> {
    let shared = recipient_secret
        .0
        .diffie_hellman(&sealed.ephemeral_public.to_dalek());
    let key_bytes = kdf(shared.as_bytes(), b"fabric-seal");
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| FabricError::DecryptionFailed)
}

/// Generates `CHALLENGE_LEN` random bytes for a challenge–response round.
#[must_use]
pub fn make_challenge() -> [u8; CHALLENGE_LEN] {
    let mut bytes = [0u8; CHALLENGE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Flips every bit of `data`. The response to a challenge is the
/// bit-inverted plaintext, re-encrypted (spec §4.3 step 3, §4.5(d)).
#[must_use]
pub fn bit_invert(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| !b).collect()
}

/// Constant-time equality, used to verify a decrypted challenge response
/// without leaking timing information about where the comparison diverges
/// (spec §4.5(d), "compare using constant-time equality").
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// A freshly generated X25519 ephemeral keypair, used once per handshake to
/// derive the session key (spec §4.5(a)).
pub struct EphemeralKeyPair {
    pub secret: SecretEncryptKey,
    pub public: PublicEncryptKey,
}

impl EphemeralKeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let secret = SecretEncryptKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Derives the shared session key from this side's ephemeral secret and
    /// the peer's ephemeral public key. Both sides compute the same value
    /// because X25519 Diffie-Hellman is commutative (spec §8, invariant 4).
    #[must_use]
    pub fn derive_session_key(&self, their_ephemeral_public: &PublicEncryptKey) -> [u8; 32] {
        let shared = self
            .secret
            .0
            .diffie_hellman(&their_ephemeral_public.to_dalek());
        kdf(shared.as_bytes(), b"fabric-session")
    }
}
