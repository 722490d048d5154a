// src/msg/mod.rs
//! Wire-format codec: header framing, TLV attributes, address obfuscation,
//! and long-term credential integrity.

pub mod attribute;
pub mod auth;
pub mod header;
pub mod xor;

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use attribute::{register_attribute, attribute_name, Attribute, DecodeFn};
pub use auth::{IntegrityOutcome, NonceIssuer, NONCE_LIFETIME};
pub use header::{
    Header, MessageClass, MessageType, TransactionId, HEADER_SIZE, MAGIC_COOKIE,
};

use crate::error::StunResult;
use attribute::{FINGERPRINT, MESSAGE_INTEGRITY};

/// Read exactly `n` bytes off a stream, failing on short read or EOF.
pub(crate) async fn read_exact_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    n: usize,
) -> StunResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// One protocol message: a header plus an ordered attribute sequence.
///
/// Order is irrelevant for lookup but preserved for encoding, because
/// MESSAGE-INTEGRITY must come after every attribute its digest covers.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    attributes: Vec<Attribute>,
}

impl Message {
    /// Build a request with a fresh random transaction id and no attributes.
    pub fn new_request(msg_type: MessageType) -> Self {
        Self {
            header: Header::new(msg_type),
            attributes: Vec::new(),
        }
    }

    /// Build a response to `request`, copying its transaction id verbatim.
    pub fn new_response(msg_type: MessageType, request: &Message) -> Self {
        Self {
            header: Header::with_transaction_id(msg_type, *request.transaction_id()),
            attributes: Vec::new(),
        }
    }

    /// Message header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Message type.
    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type()
    }

    /// Transaction id.
    pub fn transaction_id(&self) -> &TransactionId {
        self.header.transaction_id()
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut Vec<Attribute> {
        &mut self.attributes
    }

    /// Append an attribute, growing the header length by the attribute's
    /// full on-wire size so the length field always equals the byte count
    /// `encode` will emit after the header.
    pub fn add_attribute(&mut self, attr: Attribute) {
        self.header.length += attr.wire_len();
        self.attributes.push(attr);
    }

    /// First attribute of the given type, in insertion order.
    pub fn attribute(&self, attr_type: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    /// Encode header and attributes to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.header.length() as usize);
        self.header.encode_into(&mut buf);
        for attr in &self.attributes {
            attr.encode_into(&mut buf, self.header.transaction_id());
        }
        debug_assert_eq!(buf.len() - HEADER_SIZE, self.header.length() as usize);
        buf.freeze()
    }

    /// Decode one message off a stream: header first, then attributes until
    /// the header's length is consumed. Any attribute error aborts the whole
    /// decode; partial messages are never returned.
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> StunResult<Self> {
        let header = Header::decode(reader).await?;
        let body = read_exact_bytes(reader, header.length() as usize).await?;

        let mut buf = Bytes::from(body);
        let mut attributes = Vec::new();
        while buf.has_remaining() {
            attributes.push(Attribute::decode(&mut buf, header.transaction_id())?);
        }

        Ok(Self { header, attributes })
    }

    /// The canonical copy this message's integrity digest covers: the same
    /// header and attributes minus MESSAGE-INTEGRITY and FINGERPRINT, with
    /// the length recomputed as if they were never appended. The original
    /// message is left untouched.
    pub fn integrity_base(&self) -> Message {
        let mut base = Message {
            header: Header::with_transaction_id(
                self.header.msg_type(),
                *self.header.transaction_id(),
            ),
            attributes: Vec::with_capacity(self.attributes.len()),
        };
        for attr in &self.attributes {
            if matches!(attr.attr_type(), MESSAGE_INTEGRITY | FINGERPRINT) {
                continue;
            }
            base.add_attribute(attr.clone());
        }
        base
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        for attr in &self.attributes {
            write!(f, "\n  {attr}")?;
        }
        Ok(())
    }
}
