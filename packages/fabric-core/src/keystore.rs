//! The narrow read/write interface the handshake's key-continuity check
//! needs, replacing the CRDT merge "plans" called out in spec §9's Design
//! Notes: `latest` for lookup, `store_new` for first-sight writes. The
//! fuller identity/contact registry this sits underneath is an excluded
//! collaborator (spec §1).

use dashmap::DashMap;

use crate::identity::{Keys, PersonId};

/// Read/write access to pinned `Keys` objects, keyed by `PersonId`.
///
/// Implementations must never overwrite an existing entry: the
/// key-continuity invariant (spec §4.5(d), §8 invariant 6) depends on
/// `store_new` only ever being called for identities not yet seen.
pub trait KeyStore: Send + Sync {
    /// Returns the currently pinned keys for `person`, if any are known.
    fn latest(&self, person: &PersonId) -> Option<Keys>;

    /// Records `keys` as the pinned keys for `person`. Callers must check
    /// `latest` is `None` first; implementations may debug-assert this.
    fn store_new(&self, person: PersonId, keys: Keys);
}

/// In-memory [`KeyStore`] used by tests and embedders without a real
/// persisted identity registry.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    entries: DashMap<PersonId, Keys>,
}

impl InMemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn latest(&self, person: &PersonId) -> Option<Keys> {
        self.entries.get(person).map(|entry| entry.value().clone())
    }

    fn store_new(&self, person: PersonId, keys: Keys) {
        debug_assert!(
            !self.entries.contains_key(&person),
            "store_new called for an already-known PersonId"
        );
        self.entries.insert(person, keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PublicEncryptKey, PublicSignKey};
    use crate::identity::KeysOwner;
    use ed25519_dalek::SigningKey;

    fn sample_keys(person: PersonId) -> Keys {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Keys {
            owner: KeysOwner::Person(person),
            public_encryption_key: PublicEncryptKey([1; 32]),
            public_sign_key: PublicSignKey(signing.verifying_key().to_bytes()),
        }
    }

    #[test]
    fn unknown_person_returns_none() {
        let store = InMemoryKeyStore::new();
        assert!(store.latest(&PersonId([9; 32])).is_none());
    }

    #[test]
    fn store_new_then_latest_round_trips() {
        let store = InMemoryKeyStore::new();
        let person = PersonId([1; 32]);
        let keys = sample_keys(person);
        store.store_new(person, keys.clone());
        assert_eq!(store.latest(&person), Some(keys));
    }
}
