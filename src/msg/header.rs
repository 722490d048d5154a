//! Fixed 20-byte message header: type, length, magic cookie, transaction id.

use std::fmt;

use bytes::{BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::AsyncRead;

use crate::error::{FramingError, StunResult};
use crate::msg::read_exact_bytes;

/// Magic cookie as defined in RFC 5389, at bytes [4:8] of every header.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Message class, encoded in bits 4 and 8 of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    const MASK: u16 = 0x0110;

    fn from_bits(raw: u16) -> Self {
        match raw & Self::MASK {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::SuccessResponse,
            0x0110 => Self::ErrorResponse,
            _ => unreachable!(),
        }
    }

    fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Indication => write!(f, "indication"),
            Self::SuccessResponse => write!(f, "success response"),
            Self::ErrorResponse => write!(f, "error response"),
        }
    }
}

/// 14-bit message type with the RFC 5389 section 6 class/method interleaving.
///
/// Kept as an open newtype rather than a closed enum: unknown methods must
/// survive decoding so the server can route them to its unrecognized-message
/// collaborator instead of dropping the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub(crate) u16);

impl MessageType {
    /// Binding request (class Request, method 0x001).
    pub const BINDING_REQUEST: MessageType = MessageType(0x0001);
    /// Binding success response.
    pub const BINDING_RESPONSE: MessageType = MessageType(0x0101);
    /// Binding error response.
    pub const BINDING_ERROR: MessageType = MessageType(0x0111);

    /// Assemble a type from its method and class.
    ///
    /// The class bits sit at 0x0100 and 0x0010 and the 12 method bits are
    /// packed around them; a naive `method | class` concatenation is wrong
    /// for any method above 0x00F and would not interoperate. Returns `None`
    /// for methods that do not fit in 12 bits.
    pub fn from_parts(method: u16, class: MessageClass) -> Option<Self> {
        if method > 0x0FFF {
            return None;
        }
        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;
        Some(MessageType(m0 | m1 | m2 | class.bits()))
    }

    /// Message class (request, indication, success, error).
    pub fn class(self) -> MessageClass {
        MessageClass::from_bits(self.0)
    }

    /// Message method with the interleaved class bits removed.
    pub fn method(self) -> u16 {
        (self.0 & 0x000F) | ((self.0 & 0x00E0) >> 1) | ((self.0 & 0x3E00) >> 2)
    }

    /// Raw 16-bit wire value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

fn method_name(method: u16) -> Option<&'static str> {
    match method {
        0x0001 => Some("Binding"),
        _ => None,
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match method_name(self.method()) {
            Some(name) => write!(f, "{} {}", name, self.class()),
            None => write!(f, "method 0x{:03X} {}", self.method(), self.class()),
        }
    }
}

/// 96-bit transaction id.
///
/// Generated fresh for a request, copied verbatim into its response, and
/// never mutated afterwards. Also keys the IPv6 half of the address
/// obfuscation transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub(crate) [u8; 12]);

impl TransactionId {
    /// Generate a new random transaction id from the OS RNG.
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Wrap existing bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Decoded message header.
///
/// `length` counts the complete encoded attribute section that follows the
/// header: for every attribute its 4-byte sub-header, value bytes, and zero
/// padding to the next 4-byte boundary.
#[derive(Debug, Clone)]
pub struct Header {
    pub(crate) msg_type: MessageType,
    pub(crate) length: u16,
    pub(crate) transaction_id: TransactionId,
}

impl Header {
    pub(crate) fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            length: 0,
            transaction_id: TransactionId::new(),
        }
    }

    pub(crate) fn with_transaction_id(msg_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            msg_type,
            length: 0,
            transaction_id,
        }
    }

    /// Message type.
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Attribute section length in bytes.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Transaction id.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.msg_type.as_u16());
        buf.put_u16(self.length);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());
    }

    /// Read and validate 20 header bytes off a stream.
    ///
    /// Validation order: magic cookie at [4:8], then the reserved top bits of
    /// the message type, then 4-byte length alignment.
    pub(crate) async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> StunResult<Self> {
        let buf = read_exact_bytes(reader, HEADER_SIZE).await?;

        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(FramingError::BadMagicCookie(cookie).into());
        }

        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(FramingError::BadMessageType(raw_type).into());
        }

        let length = u16::from_be_bytes([buf[2], buf[3]]);
        if length % 4 != 0 {
            return Err(FramingError::MisalignedLength(length).into());
        }

        let mut id = [0u8; 12];
        id.copy_from_slice(&buf[8..20]);

        Ok(Self {
            msg_type: MessageType(raw_type),
            length,
            transaction_id: TransactionId(id),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} len={} id={}",
            self.msg_type, self.length, self.transaction_id
        )
    }
}
