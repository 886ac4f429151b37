//! The borrowed decrypt capability the handshake needs for long-term keys.
//!
//! Per the concurrency model's shared-resource policy, private key
//! material belongs to an external keychain; this crate only ever borrows
//! an encrypt/decrypt capability, never stores or owns a secret key
//! itself. `InstanceId`/`PersonId` bytes double as the corresponding
//! X25519 public key (an explicit simplification recorded in DESIGN.md),
//! so sealing a message for a peer only needs their id; decrypting
//! something sealed for *us* is the one operation that needs a borrowed
//! secret, hence this trait.

use std::collections::HashMap;

use fabric_core::{InstanceId, PersonId, SealedBox, SecretEncryptKey};

use fabric_core::FabricError;

/// Decrypts sealed boxes addressed to one of this node's long-term
/// instance or person keys.
pub trait LongTermKeyring: Send + Sync {
    fn decrypt_as_instance(
        &self,
        instance: InstanceId,
        sealed: &SealedBox,
    ) -> Result<Vec<u8>, FabricError>;

    fn decrypt_as_person(
        &self,
        person: PersonId,
        sealed: &SealedBox,
    ) -> Result<Vec<u8>, FabricError>;
}

/// An in-memory keyring holding the actual secrets, for tests and simple
/// embedders without a hardware-backed or OS keychain.
#[derive(Default)]
pub struct InMemoryKeyring {
    instance_secrets: HashMap<InstanceId, SecretEncryptKey>,
    person_secrets: HashMap<PersonId, SecretEncryptKey>,
}

impl InMemoryKeyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance_secret(&mut self, instance: InstanceId, secret: SecretEncryptKey) {
        self.instance_secrets.insert(instance, secret);
    }

    pub fn add_person_secret(&mut self, person: PersonId, secret: SecretEncryptKey) {
        self.person_secrets.insert(person, secret);
    }
}

impl LongTermKeyring for InMemoryKeyring {
    fn decrypt_as_instance(
        &self,
        instance: InstanceId,
        sealed: &SealedBox,
    ) -> Result<Vec<u8>, FabricError> {
        let secret = self
            .instance_secrets
            .get(&instance)
            .ok_or_else(|| FabricError::Internal("no secret for local instance key".into()))?;
        fabric_core::open_sealed(secret, sealed)
    }

    fn decrypt_as_person(
        &self,
        person: PersonId,
        sealed: &SealedBox,
    ) -> Result<Vec<u8>, FabricError> {
        let secret = self
            .person_secrets
            .get(&person)
            .ok_or_else(|| FabricError::Internal("no secret for local person key".into()))?;
        fabric_core::open_sealed(secret, sealed)
    }
}
