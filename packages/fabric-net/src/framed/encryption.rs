//! Post-handshake transparent frame encryption. Installed once a session
//! key has been derived (spec §4.5(a)); every frame sent or received
//! afterward is wrapped/unwrapped through this, with an independent nonce
//! counter per direction so replays and reorders within a direction are
//! detectable (spec §4.1, Encryption plugin).

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use fabric_core::FabricError;

fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Symmetric session cipher installed on a framed connection once the
/// handshake's ephemeral key exchange completes.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    send_nonce: AtomicU64,
    recv_nonce: AtomicU64,
}

impl SessionCipher {
    #[must_use]
    pub fn new(session_key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&session_key)),
            send_nonce: AtomicU64::new(0),
            recv_nonce: AtomicU64::new(0),
        }
    }

    /// Encrypts `plaintext` under the next send-direction nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let counter = self.send_nonce.fetch_add(1, Ordering::SeqCst);
        let nonce = Nonce::from_slice(&nonce_from_counter(counter));
        self.cipher
            .encrypt(nonce, plaintext)
            .expect("encryption with a fresh counter nonce cannot fail")
    }

    /// Decrypts `ciphertext` using the next expected receive-direction
    /// nonce. Frames must arrive in order; out-of-order delivery is a
    /// protocol violation at the transport layer below this type.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, FabricError> {
        let counter = self.recv_nonce.fetch_add(1, Ordering::SeqCst);
        let nonce = Nonce::from_slice(&nonce_from_counter(counter));
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| FabricError::DecryptionFailed)
    }
}
