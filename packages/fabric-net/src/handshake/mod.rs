//! C5: the handshake and authentication protocol run once a raw framed
//! connection exists, in the four sub-protocols of spec §4.5: (a) public
//! key exchange and ephemeral session establishment, (b) connection-group
//! name exchange, (c) a one-byte sync barrier, (d) person-id and key
//! challenge–response with key continuity. Any deviation or timeout
//! aborts the connection with a typed error; nothing is retried at this
//! layer (spec §4.5, "Failure policy").

pub mod keyring;

use std::time::Duration;

use fabric_core::{
    bit_invert, constant_time_eq, make_challenge, seal, EphemeralKeyPair, FabricError,
    HandshakeMessage, InstanceId, Keys, KeyStore, PersonId, PublicEncryptKey, SealedBox,
    DEFAULT_GROUP_NAME,
};

use crate::framed::FramedConnection;
use keyring::LongTermKeyring;

/// Which side initiated the raw connection. The initiator's proposed
/// connection-group name wins (spec §4.5(b)); challenge order in step (d)
/// also depends on role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// External policy hook resolving the left-open "take-over" pairing
/// question (spec §9, Open Questions): suppresses the key-continuity
/// check when a pairing flow has already vetted the new key out of band.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub skip_local_key_compare: bool,
    pub expected_remote_person_id: Option<PersonId>,
    pub timeout: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            skip_local_key_compare: false,
            expected_remote_person_id: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the handshake needs from its caller (the route manager or a
/// relay listener handing off a socket).
pub struct HandshakeInput<'a> {
    pub role: Role,
    pub local_instance_key: InstanceId,
    /// The remote instance key expected on this route. Always known by
    /// the initiator (it dialed this peer); unknown to an acceptor until
    /// learned from the peer's `communication_request`.
    pub remote_instance_key: Option<InstanceId>,
    /// Instance keys this acceptor is willing to talk to. Ignored for an
    /// initiator.
    pub allowed_instance_keys: Vec<InstanceId>,
    /// When true, the acceptor accepts any source instance key regardless
    /// of `allowed_instance_keys` (a catch-all route, spec §4.6).
    pub accept_any: bool,
    /// The connection-group name to propose, when this side initiated the
    /// connection locally (spec §4.5(b)).
    pub proposed_group_name: Option<String>,
    pub local_person_id: PersonId,
    pub local_keys: Keys,
    pub keyring: &'a dyn LongTermKeyring,
    pub keystore: &'a dyn KeyStore,
    pub options: HandshakeOptions,
}

/// The result of a successfully completed handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub remote_instance_key: InstanceId,
    pub session_key: [u8; 32],
    pub group_name: String,
    pub remote_person_id: PersonId,
    pub remote_keys: Keys,
    pub is_new_person: bool,
}

/// Runs the full handshake over `conn`, installing session encryption on
/// success. Enforces the overall deadline from `input.options.timeout`
/// (spec §5).
pub async fn run(
    conn: &FramedConnection,
    input: HandshakeInput<'_>,
) -> Result<HandshakeOutcome, FabricError> {
    let timeout = input.options.timeout;
    tokio::time::timeout(timeout, run_inner(conn, input))
        .await
        .map_err(|_| FabricError::Timeout)?
}

async fn run_inner(
    conn: &FramedConnection,
    input: HandshakeInput<'_>,
) -> Result<HandshakeOutcome, FabricError> {
    let (remote_instance_key, session_key) =
        exchange_keys_and_establish_session(conn, &input).await?;
    let group_name = exchange_group_name(conn, &input).await?;
    sync_barrier(conn).await?;
    let (remote_person_id, remote_keys, is_new_person) =
        exchange_identity_with_challenge(conn, &input).await?;

    Ok(HandshakeOutcome {
        remote_instance_key,
        session_key,
        group_name,
        remote_person_id,
        remote_keys,
        is_new_person,
    })
}

async fn exchange_keys_and_establish_session(
    conn: &FramedConnection,
    input: &HandshakeInput<'_>,
) -> Result<(InstanceId, [u8; 32]), FabricError> {
    let remote_instance_key = match input.role {
        Role::Initiator => {
            let target = input.remote_instance_key.ok_or_else(|| {
                FabricError::Internal("initiator requires a known target instance key".into())
            })?;
            conn.send_json(&HandshakeMessage::CommunicationRequest {
                source_public_key: input.local_instance_key,
                target_public_key: target,
            })
            .await?;
            match conn.wait_for_message::<HandshakeMessage>().await? {
                HandshakeMessage::CommunicationReady { ready: true } => {}
                HandshakeMessage::CommunicationReady { ready: false } => {
                    return Err(FabricError::Rejected)
                }
                _ => {
                    return Err(FabricError::ProtocolViolation(
                        "expected communication_ready".into(),
                    ))
                }
            }
            target
        }
        Role::Acceptor => {
            let (source, target) = match conn.wait_for_message::<HandshakeMessage>().await? {
                HandshakeMessage::CommunicationRequest {
                    source_public_key,
                    target_public_key,
                } => (source_public_key, target_public_key),
                _ => {
                    return Err(FabricError::ProtocolViolation(
                        "expected communication_request".into(),
                    ))
                }
            };
            let allowed = target == input.local_instance_key
                && (input.accept_any || input.allowed_instance_keys.contains(&source));
            conn.send_json(&HandshakeMessage::CommunicationReady { ready: allowed })
                .await?;
            if !allowed {
                return Err(FabricError::Rejected);
            }
            source
        }
    };

    let ephemeral = EphemeralKeyPair::generate();
    let sealed_own = seal(&PublicEncryptKey(remote_instance_key.0), &ephemeral.public.0);
    conn.send_json(&HandshakeMessage::TemporaryKeys {
        sealed_ephemeral: sealed_own,
    })
    .await?;

    let their_sealed = match conn.wait_for_message::<HandshakeMessage>().await? {
        HandshakeMessage::TemporaryKeys { sealed_ephemeral } => sealed_ephemeral,
        _ => return Err(FabricError::ProtocolViolation("expected temporary_keys".into())),
    };
    let their_ephemeral_bytes = input
        .keyring
        .decrypt_as_instance(input.local_instance_key, &their_sealed)?;
    let their_ephemeral_pub = PublicEncryptKey(
        their_ephemeral_bytes
            .try_into()
            .map_err(|_| FabricError::ProtocolViolation("malformed ephemeral key".into()))?,
    );

    let session_key = ephemeral.derive_session_key(&their_ephemeral_pub);
    conn.install_encryption(session_key);

    Ok((remote_instance_key, session_key))
}

async fn exchange_group_name(
    conn: &FramedConnection,
    input: &HandshakeInput<'_>,
) -> Result<String, FabricError> {
    match input.role {
        Role::Initiator => {
            let name = input
                .proposed_group_name
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());
            conn.send_json(&HandshakeMessage::ConnectionGroupName { name: name.clone() })
                .await?;
            match conn.wait_for_message::<HandshakeMessage>().await? {
                HandshakeMessage::ConnectionGroupName { name } => Ok(name),
                _ => Err(FabricError::ProtocolViolation(
                    "expected connection_group_name".into(),
                )),
            }
        }
        Role::Acceptor => {
            let name = match conn.wait_for_message::<HandshakeMessage>().await? {
                HandshakeMessage::ConnectionGroupName { name } => name,
                _ => {
                    return Err(FabricError::ProtocolViolation(
                        "expected connection_group_name".into(),
                    ))
                }
            };
            // The initiator's proposal always wins; the acceptor just
            // echoes it back (spec §4.5(b)).
            conn.send_json(&HandshakeMessage::ConnectionGroupName { name: name.clone() })
                .await?;
            Ok(name)
        }
    }
}

async fn sync_barrier(conn: &FramedConnection) -> Result<(), FabricError> {
    const TOKEN: u8 = 0x5a;
    conn.send_json(&HandshakeMessage::Synchronisation { token: TOKEN })
        .await?;
    match conn.wait_for_message::<HandshakeMessage>().await? {
        HandshakeMessage::Synchronisation { token } if token == TOKEN => Ok(()),
        HandshakeMessage::Synchronisation { .. } => Err(FabricError::ProtocolViolation(
            "sync barrier token mismatch".into(),
        )),
        _ => Err(FabricError::ProtocolViolation("expected synchronisation".into())),
    }
}

async fn send_binary_sealed(conn: &FramedConnection, sealed: &SealedBox) -> Result<(), FabricError> {
    let bytes = serde_json::to_vec(sealed)
        .map_err(|e| FabricError::Internal(format!("serialize sealed box: {e}")))?;
    conn.send(bytes).await
}

async fn recv_binary_sealed(conn: &FramedConnection) -> Result<SealedBox, FabricError> {
    let bytes = conn.wait_for_binary_message().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FabricError::ProtocolViolation(format!("malformed sealed box: {e}")))
}

async fn challenge_as_challenger(
    conn: &FramedConnection,
    local_person_id: PersonId,
    remote_person_id: PersonId,
    keyring: &dyn LongTermKeyring,
) -> Result<(), FabricError> {
    let challenge = make_challenge();
    let sealed = seal(&PublicEncryptKey(remote_person_id.0), &challenge);
    send_binary_sealed(conn, &sealed).await?;

    let sealed_response = recv_binary_sealed(conn).await?;
    let decrypted = keyring.decrypt_as_person(local_person_id, &sealed_response)?;
    if !constant_time_eq(&decrypted, &bit_invert(&challenge)) {
        return Err(FabricError::AuthFailed);
    }
    Ok(())
}

async fn challenge_as_responder(
    conn: &FramedConnection,
    local_person_id: PersonId,
    remote_person_id: PersonId,
    keyring: &dyn LongTermKeyring,
) -> Result<(), FabricError> {
    let sealed = recv_binary_sealed(conn).await?;
    let challenge = keyring.decrypt_as_person(local_person_id, &sealed)?;
    let response_plain = bit_invert(&challenge);
    let sealed_response = seal(&PublicEncryptKey(remote_person_id.0), &response_plain);
    send_binary_sealed(conn, &sealed_response).await
}

async fn exchange_identity_with_challenge(
    conn: &FramedConnection,
    input: &HandshakeInput<'_>,
) -> Result<(PersonId, Keys, bool), FabricError> {
    conn.send_json(&HandshakeMessage::PersonIdObject {
        person_id: input.local_person_id,
    })
    .await?;
    conn.send_json(&HandshakeMessage::KeysObject {
        keys: input.local_keys.clone(),
    })
    .await?;

    let remote_person_id = match conn.wait_for_message::<HandshakeMessage>().await? {
        HandshakeMessage::PersonIdObject { person_id } => person_id,
        _ => return Err(FabricError::ProtocolViolation("expected person_id_object".into())),
    };
    let remote_keys = match conn.wait_for_message::<HandshakeMessage>().await? {
        HandshakeMessage::KeysObject { keys } => keys,
        _ => return Err(FabricError::ProtocolViolation("expected keys_object".into())),
    };

    if let Some(expected) = input.options.expected_remote_person_id {
        if expected != remote_person_id {
            return Err(FabricError::AuthFailed);
        }
    }

    match input.role {
        Role::Initiator => {
            challenge_as_challenger(conn, input.local_person_id, remote_person_id, input.keyring)
                .await?;
            challenge_as_responder(conn, input.local_person_id, remote_person_id, input.keyring)
                .await?;
        }
        Role::Acceptor => {
            challenge_as_responder(conn, input.local_person_id, remote_person_id, input.keyring)
                .await?;
            challenge_as_challenger(conn, input.local_person_id, remote_person_id, input.keyring)
                .await?;
        }
    }

    let is_new_person = match input.keystore.latest(&remote_person_id) {
        Some(existing) => {
            let changed = existing.public_encryption_key != remote_keys.public_encryption_key
                || existing.public_sign_key != remote_keys.public_sign_key;
            if changed && !input.options.skip_local_key_compare {
                return Err(FabricError::KeyMismatch);
            }
            false
        }
        None => {
            input.keystore.store_new(remote_person_id, remote_keys.clone());
            true
        }
    };

    Ok((remote_person_id, remote_keys, is_new_person))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::keyring::InMemoryKeyring;
    use fabric_core::{InMemoryKeyStore, KeysOwner, PublicSignKey, SecretEncryptKey};
    use proptest::prelude::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, client_async};

    async fn loopback_pair() -> (FramedConnection, FramedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        });
        let client_stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (client_ws, _) = client_async(format!("ws://{addr}"), client_stream)
            .await
            .unwrap();
        let server_ws = server_task.await.unwrap();

        let cfg = crate::config::FabricConfig::default();
        let client = FramedConnection::spawn(
            client_ws,
            cfg.max_frame_size,
            cfg.keepalive_interval,
            cfg.keepalive_missed_limit,
        );
        let server = FramedConnection::spawn(
            server_ws,
            cfg.max_frame_size,
            cfg.keepalive_interval,
            cfg.keepalive_missed_limit,
        );
        (client, server)
    }

    fn sample_keys(owner: KeysOwner, enc_pub: PublicEncryptKey) -> Keys {
        Keys {
            owner,
            public_encryption_key: enc_pub,
            public_sign_key: PublicSignKey(
                ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng)
                    .verifying_key()
                    .to_bytes(),
            ),
        }
    }

    #[tokio::test]
    async fn full_handshake_succeeds_both_sides_agree_session_key() {
        let (initiator_conn, acceptor_conn) = loopback_pair().await;

        let initiator_instance_secret = SecretEncryptKey::generate();
        let initiator_instance_key = InstanceId(initiator_instance_secret.public_key().0);
        let acceptor_instance_secret = SecretEncryptKey::generate();
        let acceptor_instance_key = InstanceId(acceptor_instance_secret.public_key().0);

        let initiator_person_secret = SecretEncryptKey::generate();
        let initiator_person_id = PersonId(initiator_person_secret.public_key().0);
        let acceptor_person_secret = SecretEncryptKey::generate();
        let acceptor_person_id = PersonId(acceptor_person_secret.public_key().0);

        let mut initiator_keyring = InMemoryKeyring::new();
        initiator_keyring.add_instance_secret(initiator_instance_key, initiator_instance_secret);
        initiator_keyring.add_person_secret(initiator_person_id, initiator_person_secret);

        let mut acceptor_keyring = InMemoryKeyring::new();
        acceptor_keyring.add_instance_secret(acceptor_instance_key, acceptor_instance_secret);
        acceptor_keyring.add_person_secret(acceptor_person_id, acceptor_person_secret);

        let initiator_keystore = InMemoryKeyStore::new();
        let acceptor_keystore = InMemoryKeyStore::new();

        let initiator_keys = sample_keys(
            KeysOwner::Person(initiator_person_id),
            PublicEncryptKey(initiator_person_id.0),
        );
        let acceptor_keys = sample_keys(
            KeysOwner::Person(acceptor_person_id),
            PublicEncryptKey(acceptor_person_id.0),
        );

        let initiator_input = HandshakeInput {
            role: Role::Initiator,
            local_instance_key: initiator_instance_key,
            remote_instance_key: Some(acceptor_instance_key),
            allowed_instance_keys: vec![],
            accept_any: false,
            proposed_group_name: Some("project-x".into()),
            local_person_id: initiator_person_id,
            local_keys: initiator_keys,
            keyring: &initiator_keyring,
            keystore: &initiator_keystore,
            options: HandshakeOptions::default(),
        };
        let acceptor_input = HandshakeInput {
            role: Role::Acceptor,
            local_instance_key: acceptor_instance_key,
            remote_instance_key: None,
            allowed_instance_keys: vec![initiator_instance_key],
            accept_any: false,
            proposed_group_name: None,
            local_person_id: acceptor_person_id,
            local_keys: acceptor_keys,
            keyring: &acceptor_keyring,
            keystore: &acceptor_keystore,
            options: HandshakeOptions::default(),
        };

        let (initiator_outcome, acceptor_outcome) = tokio::join!(
            run(&initiator_conn, initiator_input),
            run(&acceptor_conn, acceptor_input),
        );

        let initiator_outcome = initiator_outcome.unwrap();
        let acceptor_outcome = acceptor_outcome.unwrap();

        assert_eq!(initiator_outcome.session_key, acceptor_outcome.session_key);
        assert_eq!(initiator_outcome.group_name, "project-x");
        assert_eq!(acceptor_outcome.group_name, "project-x");
        assert_eq!(initiator_outcome.remote_person_id, acceptor_person_id);
        assert_eq!(acceptor_outcome.remote_person_id, initiator_person_id);
        assert!(initiator_outcome.is_new_person);
        assert!(acceptor_outcome.is_new_person);
    }

    #[tokio::test]
    async fn acceptor_rejects_disallowed_instance_key() {
        let (initiator_conn, acceptor_conn) = loopback_pair().await;

        let initiator_instance_secret = SecretEncryptKey::generate();
        let initiator_instance_key = InstanceId(initiator_instance_secret.public_key().0);
        let acceptor_instance_secret = SecretEncryptKey::generate();
        let acceptor_instance_key = InstanceId(acceptor_instance_secret.public_key().0);

        let mut initiator_keyring = InMemoryKeyring::new();
        initiator_keyring.add_instance_secret(initiator_instance_key, initiator_instance_secret);
        let mut acceptor_keyring = InMemoryKeyring::new();
        acceptor_keyring.add_instance_secret(acceptor_instance_key, acceptor_instance_secret);

        let initiator_keystore = InMemoryKeyStore::new();
        let acceptor_keystore = InMemoryKeyStore::new();

        let initiator_person_id = PersonId([1; 32]);
        let acceptor_person_id = PersonId([2; 32]);

        let initiator_input = HandshakeInput {
            role: Role::Initiator,
            local_instance_key: initiator_instance_key,
            remote_instance_key: Some(acceptor_instance_key),
            allowed_instance_keys: vec![],
            accept_any: false,
            proposed_group_name: None,
            local_person_id: initiator_person_id,
            local_keys: sample_keys(
                KeysOwner::Person(initiator_person_id),
                PublicEncryptKey(initiator_person_id.0),
            ),
            keyring: &initiator_keyring,
            keystore: &initiator_keystore,
            options: HandshakeOptions::default(),
        };
        // Deliberately empty allow-list: the acceptor should reject.
        let acceptor_input = HandshakeInput {
            role: Role::Acceptor,
            local_instance_key: acceptor_instance_key,
            remote_instance_key: None,
            allowed_instance_keys: vec![],
            accept_any: false,
            proposed_group_name: None,
            local_person_id: acceptor_person_id,
            local_keys: sample_keys(
                KeysOwner::Person(acceptor_person_id),
                PublicEncryptKey(acceptor_person_id.0),
            ),
            keyring: &acceptor_keyring,
            keystore: &acceptor_keystore,
            options: HandshakeOptions::default(),
        };

        let (initiator_result, acceptor_result) = tokio::join!(
            run(&initiator_conn, initiator_input),
            run(&acceptor_conn, acceptor_input),
        );

        assert_eq!(initiator_result.unwrap_err(), FabricError::Rejected);
        assert_eq!(acceptor_result.unwrap_err(), FabricError::Rejected);
    }

    /// Reproduces the key-continuity comparison from
    /// `exchange_identity_with_challenge`: a person seen before is flagged
    /// changed iff either public key differs from what the store has on
    /// file (spec §4.5(d), "key continuity").
    fn is_changed(keystore: &InMemoryKeyStore, person_id: PersonId, remote_keys: &Keys) -> bool {
        match keystore.latest(&person_id) {
            Some(existing) => {
                existing.public_encryption_key != remote_keys.public_encryption_key
                    || existing.public_sign_key != remote_keys.public_sign_key
            }
            None => false,
        }
    }

    proptest::proptest! {
        /// Re-presenting the exact same keys never trips key continuity,
        /// whatever the person id or key bytes happen to be.
        #[test]
        fn unchanged_keys_never_flag_continuity(person_bytes: [u8; 32], enc_bytes: [u8; 32]) {
            let keystore = InMemoryKeyStore::new();
            let person_id = PersonId(person_bytes);
            let keys = sample_keys(KeysOwner::Person(person_id), PublicEncryptKey(enc_bytes));
            keystore.store_new(person_id, keys.clone());
            prop_assert!(!is_changed(&keystore, person_id, &keys));
        }

        /// A differing encryption key always trips key continuity for a
        /// previously-seen person, regardless of which bytes differ.
        #[test]
        fn differing_encryption_key_flags_continuity(
            person_bytes: [u8; 32],
            enc_bytes_a: [u8; 32],
            enc_bytes_b: [u8; 32],
        ) {
            prop_assume!(enc_bytes_a != enc_bytes_b);
            let keystore = InMemoryKeyStore::new();
            let person_id = PersonId(person_bytes);
            let first = sample_keys(KeysOwner::Person(person_id), PublicEncryptKey(enc_bytes_a));
            keystore.store_new(person_id, first);
            let second = sample_keys(KeysOwner::Person(person_id), PublicEncryptKey(enc_bytes_b));
            prop_assert!(is_changed(&keystore, person_id, &second));
        }
    }
}
