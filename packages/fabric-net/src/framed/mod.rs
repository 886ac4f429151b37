//! C1: a duplex framed message stream with transparent post-handshake
//! encryption and keepalive (spec §4.1).

pub mod connection;
pub mod encryption;

pub use connection::{ConnectionState, FramedConnection};
pub use encryption::SessionCipher;
