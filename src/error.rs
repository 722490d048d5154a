use std::io;
use thiserror::Error;

/// Top-level error type for all protocol operations.
#[derive(Debug, Error)]
pub enum StunError {
    /// Connect/read/write failure. Fatal to the current transaction or
    /// connection, never to the process.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The current message could not be framed or parsed.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The message parsed but its shape was not what the peer may send here.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Credential validation failure.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Start-time configuration error (e.g. attribute registry misuse).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client exhausted its retransmission budget.
    #[error("server timed out after {attempts} requests")]
    ServerTimedOut { attempts: u32 },
}

/// Errors while decoding a single message off the wire. These abort the
/// message currently being parsed, nothing more.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Bytes [4:8] of the header were not the magic cookie.
    #[error("invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    BadMagicCookie(u32),

    /// The two reserved high bits of the message type were set.
    #[error("reserved bits set in message type 0x{0:04X}")]
    BadMessageType(u16),

    /// Header length field not a multiple of 4.
    #[error("message length {0} is not a multiple of 4")]
    MisalignedLength(u16),

    /// Fewer than 4 bytes left where an attribute sub-header was expected.
    #[error("truncated attribute sub-header: {available} of 4 bytes available")]
    TruncatedSubHeader { available: usize },

    /// An attribute declared more value bytes than the message carries.
    #[error("attribute 0x{attr_type:04X} declares {declared} bytes but only {available} remain")]
    TruncatedAttribute {
        attr_type: u16,
        declared: usize,
        available: usize,
    },

    /// A registered attribute's value did not parse.
    #[error("attribute 0x{attr_type:04X} value malformed: {reason}")]
    AttributeParse { attr_type: u16, reason: String },

    /// Address attribute with a family byte other than 0x01/0x02.
    #[error("invalid address family: 0x{0:02X}")]
    InvalidAddressFamily(u8),
}

/// Well-formed messages that are wrong for the current exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message type the current state machine has no handling for.
    #[error("unexpected message type 0x{0:04X}")]
    UnexpectedMessageType(u16),

    /// The server's reply carried neither a usable address nor a challenge.
    #[error("malformed server response: {0}")]
    MalformedServerResponse(&'static str),

    /// USERNAME values are capped at 512 bytes.
    #[error("username longer than 512 bytes")]
    UsernameTooLong,

    /// REALM values are capped at 127 bytes.
    #[error("realm longer than 127 bytes")]
    RealmTooLong,

    /// ERROR-CODE reason phrases are capped at 128 bytes.
    #[error("reason phrase longer than 128 bytes")]
    ReasonTooLong,

    /// ERROR-CODE numeric values live in [300, 699].
    #[error("error code {0} outside 300..=699")]
    ErrorCodeOutOfRange(u16),
}

/// Credential failures. On the server each maps to a specific ERROR-CODE
/// response; on the client each maps to a retry-or-fail decision.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Request lacked the credential attribute named here.
    #[error("missing credential attribute: {0}")]
    MissingAttribute(&'static str),

    /// The authenticator knows no password for this username.
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    /// The nonce's embedded expiry has passed.
    #[error("nonce is stale")]
    StaleNonce,

    /// MESSAGE-INTEGRITY was present but did not verify.
    #[error("MESSAGE-INTEGRITY check failed")]
    BadIntegrity,

    /// The server rejected a request that already carried credentials.
    #[error("server rejected the supplied credentials")]
    InvalidCredentials,
}

/// Result type for protocol operations.
pub type StunResult<T> = Result<T, StunError>;
