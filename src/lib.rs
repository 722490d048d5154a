//! Gust - STUN-style NAT traversal (lib.rs)
//!
//! An RFC 5389 family binding protocol engine: magic-cookie-framed messages
//! carrying typed TLV attributes, XOR-obfuscated reflexive addresses, and
//! long-term credential authentication, with a retransmitting client and a
//! per-connection server validation pipeline over any byte-stream transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod msg;
pub mod server;

// Re-export the protocol surface
pub use msg::{
    attribute_name, register_attribute, Attribute, Header, IntegrityOutcome, Message,
    MessageClass, MessageType, NonceIssuer, TransactionId, HEADER_SIZE, MAGIC_COOKIE,
    NONCE_LIFETIME,
};

// Re-export the state machines
pub use client::{Client, Credentials, RetryPolicy};
pub use server::{Authenticator, Connection, Server};

// Re-export error types
pub use error::{AuthError, FramingError, ProtocolError, StunError, StunResult};

/// Protocol library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the given default level.
///
/// `RUST_LOG` wins when set. Used by the demo binaries; library code only
/// emits `tracing` events and never installs a subscriber itself.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
