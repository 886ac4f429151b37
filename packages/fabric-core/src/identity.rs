//! Identity types: `PersonId`, `InstanceId`, and the `Keys` object pinned
//! for each of them.
//!
//! These are intentionally thin. The higher-level "who is this person"
//! registry (profiles, contacts) is an excluded collaborator; this crate
//! only needs stable, hashable identifiers and the key material pinned to
//! them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicEncryptKey, PublicSignKey};

/// Stable identifier of a person, derived from their identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonId(pub [u8; 32]);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Stable identifier of a running node, owned by exactly one `PersonId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub [u8; 32]);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Owner of a `Keys` object: either a person or an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeysOwner {
    Person(PersonId),
    Instance(InstanceId),
}

/// Latest public encryption key and public signing key pinned to an owner.
///
/// `Keys` objects are write-once per owner at this layer (see
/// [`crate::keystore::KeyStore`]): the key-continuity invariant (spec §4.5(d))
/// depends on this layer never silently overwriting a previously stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keys {
    pub owner: KeysOwner,
    pub public_encryption_key: PublicEncryptKey,
    pub public_sign_key: PublicSignKey,
}

/// A single entry in the local instances list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalInstanceEntry {
    pub instance: InstanceId,
    /// Exactly one entry in a `LocalInstancesList` has `main == true`.
    pub main: bool,
}

/// Singleton, versioned list of the instances this node holds private keys
/// for. Created on first use with the main instance; extended when a new
/// local instance is marked (spec §6, Persisted state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalInstancesList {
    pub version: u64,
    pub instances: Vec<LocalInstanceEntry>,
}

impl LocalInstancesList {
    /// Creates a new list with a single main instance.
    #[must_use]
    pub fn new_with_main(instance: InstanceId) -> Self {
        Self {
            version: 1,
            instances: vec![LocalInstanceEntry {
                instance,
                main: true,
            }],
        }
    }

    /// Returns the main instance, if one is marked.
    #[must_use]
    pub fn main_instance(&self) -> Option<InstanceId> {
        self.instances
            .iter()
            .find(|e| e.main)
            .map(|e| e.instance)
    }

    /// Adds a new non-main local instance, bumping the version.
    pub fn add_instance(&mut self, instance: InstanceId) {
        if self.instances.iter().any(|e| e.instance == instance) {
            return;
        }
        self.instances.push(LocalInstanceEntry {
            instance,
            main: false,
        });
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_with_main_marks_single_main() {
        let list = LocalInstancesList::new_with_main(InstanceId([1; 32]));
        assert_eq!(list.version, 1);
        assert_eq!(list.main_instance(), Some(InstanceId([1; 32])));
    }

    #[test]
    fn add_instance_bumps_version_once() {
        let mut list = LocalInstancesList::new_with_main(InstanceId([1; 32]));
        list.add_instance(InstanceId([2; 32]));
        assert_eq!(list.version, 2);
        assert!(list.instances.iter().any(|e| e.instance == InstanceId([2; 32]) && !e.main));

        // Adding the same instance again is a no-op.
        list.add_instance(InstanceId([2; 32]));
        assert_eq!(list.version, 2);
    }

    #[test]
    fn display_formats_as_hex() {
        let id = PersonId([0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
    }
}
