//! The closed error taxonomy of spec §7, realized as a single enum so every
//! fallible operation in the fabric returns the same `Result` type.

use thiserror::Error;

/// Every way a connection, handshake, or route operation can fail.
///
/// Variants map one-to-one onto the Error Kinds table of spec §7, plus the
/// three framed-connection-specific kinds from §4.1.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FabricError {
    /// The underlying transport closed, whether by the peer, a keepalive
    /// timeout, or a local `close()` call. Terminal; may trigger a
    /// reconnect depending on the caller.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// An awaited operation (handshake step, `waitForMessage`, dial) did
    /// not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A peer sent a malformed frame or an unexpected command for the
    /// current protocol state. No brief reconnect; the route is
    /// tombstoned until routes are reconfigured.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote key was not in the allowed set for the route, or the
    /// acceptor otherwise refused the handshake.
    #[error("connection rejected")]
    Rejected,

    /// A challenge–response step failed verification.
    #[error("authentication failed")]
    AuthFailed,

    /// The key presented by a previously-seen `PersonId` differs from the
    /// one on file, and the check was not suppressed.
    #[error("key mismatch for known identity")]
    KeyMismatch,

    /// This connection lost the duplicate-resolution race and was closed
    /// in favor of the existing one.
    #[error("duplicate connection dropped")]
    DuplicateDropped,

    /// The route was explicitly disabled while in flight.
    #[error("route stopped")]
    RouteStopped,

    /// An internal invariant was violated (e.g. an outgoing route
    /// registered against a catch-all group). Logged at `error!`; never
    /// retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation was cancelled via `stop()` or shutdown.
    #[error("cancelled")]
    Cancelled,

    /// An inbound frame exceeded the configured maximum frame size.
    #[error("frame too large")]
    FrameTooLarge,

    /// Decryption or authentication of an encrypted frame/sealed box failed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// No pong was received within the configured number of missed
    /// keepalive intervals.
    #[error("keepalive timeout")]
    KeepaliveTimeout,
}

impl FabricError {
    /// Whether this error kind permits the route manager to schedule a
    /// reconnect, per the Policy column of spec §7.
    #[must_use]
    pub fn permits_reconnect(&self) -> bool {
        matches!(
            self,
            FabricError::TransportClosed(_) | FabricError::Timeout
        )
    }
}
