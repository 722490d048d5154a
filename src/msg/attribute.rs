//! TLV attribute codec and the process-wide attribute registry.
//!
//! Attributes in 0x0000-0x7FFF are comprehension-required: a receiver that
//! does not understand one may not silently act on the message. Attributes
//! in 0x8000-0xFFFF are comprehension-optional and safe to ignore. Either
//! way the decoder never fails just because a type is unregistered; unknown
//! types come back as [`Attribute::Raw`] and higher layers decide.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::error::{FramingError, ProtocolError, StunError, StunResult};
use crate::msg::header::TransactionId;
use crate::msg::xor;

// Comprehension-required range (0x0000-0x7FFF).
pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const USERNAME: u16 = 0x0006;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const REALM: u16 = 0x0014;
pub const NONCE: u16 = 0x0015;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;

// Comprehension-optional range (0x8000-0xFFFF).
pub const SOFTWARE: u16 = 0x8022;
pub const ALTERNATE_SERVER: u16 = 0x8023;
pub const FINGERPRINT: u16 = 0x8028;

/// Error codes used by the binding exchange.
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_UNAUTHORIZED: u16 = 401;
pub const CODE_STALE_NONCE: u16 = 438;

/// One decoded attribute.
///
/// Typed variants exist for the attributes the engine acts on; everything
/// else is carried as `Raw` with its exact wire value so it survives a
/// re-encode byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// USERNAME (0x0006), at most 512 bytes of UTF-8.
    Username(String),
    /// MESSAGE-INTEGRITY (0x0008), HMAC-SHA256 output.
    MessageIntegrity(Vec<u8>),
    /// ERROR-CODE (0x0009).
    ErrorCode { code: u16, reason: String },
    /// REALM (0x0014), at most 127 bytes of UTF-8.
    Realm(String),
    /// NONCE (0x0015), opaque to the client.
    Nonce(Vec<u8>),
    /// XOR-MAPPED-ADDRESS (0x0020), already deobfuscated against the
    /// enclosing header.
    XorMappedAddress(SocketAddr),
    /// Any attribute without a registered typed decoder.
    Raw { attr_type: u16, value: Vec<u8> },
}

impl Attribute {
    /// Build a USERNAME attribute, rejecting values over 512 bytes.
    pub fn username(username: &str) -> StunResult<Self> {
        if username.len() > 512 {
            return Err(ProtocolError::UsernameTooLong.into());
        }
        Ok(Self::Username(username.to_owned()))
    }

    /// Build a REALM attribute, rejecting values over 127 bytes.
    pub fn realm(realm: &str) -> StunResult<Self> {
        if realm.len() > 127 {
            return Err(ProtocolError::RealmTooLong.into());
        }
        Ok(Self::Realm(realm.to_owned()))
    }

    /// Build an ERROR-CODE attribute. The code must lie in [300, 699] and
    /// the reason phrase in at most 128 bytes.
    pub fn error_code(code: u16, reason: &str) -> StunResult<Self> {
        if !(300..=699).contains(&code) {
            return Err(ProtocolError::ErrorCodeOutOfRange(code).into());
        }
        if reason.len() > 128 {
            return Err(ProtocolError::ReasonTooLong.into());
        }
        Ok(Self::ErrorCode {
            code,
            reason: reason.to_owned(),
        })
    }

    /// Build a NONCE attribute.
    pub fn nonce(value: Vec<u8>) -> Self {
        Self::Nonce(value)
    }

    /// Build a MESSAGE-INTEGRITY attribute from a precomputed digest.
    pub fn message_integrity(mac: Vec<u8>) -> Self {
        Self::MessageIntegrity(mac)
    }

    /// Build an XOR-MAPPED-ADDRESS attribute.
    pub fn xor_mapped_address(addr: SocketAddr) -> Self {
        Self::XorMappedAddress(addr)
    }

    /// 16-bit attribute type.
    pub fn attr_type(&self) -> u16 {
        match self {
            Self::Username(_) => USERNAME,
            Self::MessageIntegrity(_) => MESSAGE_INTEGRITY,
            Self::ErrorCode { .. } => ERROR_CODE,
            Self::Realm(_) => REALM,
            Self::Nonce(_) => NONCE,
            Self::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Self::Raw { attr_type, .. } => *attr_type,
        }
    }

    /// Whether a receiver must understand this attribute to act on the
    /// message.
    pub fn comprehension_required(&self) -> bool {
        self.attr_type() < 0x8000
    }

    /// Registered human-readable name, if any.
    pub fn name(&self) -> Option<&'static str> {
        attribute_name(self.attr_type())
    }

    fn value_bytes(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::Username(s) | Self::Realm(s) => s.as_bytes().to_vec(),
            Self::MessageIntegrity(v) | Self::Nonce(v) => v.clone(),
            Self::ErrorCode { code, reason } => {
                let mut out = Vec::with_capacity(4 + reason.len());
                out.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
                out.extend_from_slice(reason.as_bytes());
                out
            }
            Self::XorMappedAddress(addr) => xor::obfuscate(addr, transaction_id),
            Self::Raw { value, .. } => value.clone(),
        }
    }

    /// Value length in bytes, before padding.
    pub fn value_len(&self) -> u16 {
        let len = match self {
            Self::Username(s) | Self::Realm(s) => s.len(),
            Self::MessageIntegrity(v) | Self::Nonce(v) => v.len(),
            Self::ErrorCode { reason, .. } => 4 + reason.len(),
            Self::XorMappedAddress(addr) => {
                if addr.is_ipv4() {
                    8
                } else {
                    20
                }
            }
            Self::Raw { value, .. } => value.len(),
        };
        len as u16
    }

    /// Complete on-wire size: sub-header, value, padding.
    pub fn wire_len(&self) -> u16 {
        let value_len = self.value_len();
        let padding = (4 - value_len % 4) % 4;
        4 + value_len + padding
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut, transaction_id: &TransactionId) {
        let value = self.value_bytes(transaction_id);
        buf.put_u16(self.attr_type());
        buf.put_u16(value.len() as u16);
        buf.put_slice(&value);
        let padding = (4 - value.len() % 4) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode one attribute off a length-bounded buffer: 4-byte sub-header,
    /// value, then skipped padding. Dispatches through the registry; types
    /// without an entry fall back to [`Attribute::Raw`].
    pub(crate) fn decode(buf: &mut Bytes, transaction_id: &TransactionId) -> StunResult<Self> {
        if buf.remaining() < 4 {
            return Err(FramingError::TruncatedSubHeader {
                available: buf.remaining(),
            }
            .into());
        }
        let attr_type = buf.get_u16();
        let declared = buf.get_u16() as usize;

        if buf.remaining() < declared {
            return Err(FramingError::TruncatedAttribute {
                attr_type,
                declared,
                available: buf.remaining(),
            }
            .into());
        }
        let value = buf.copy_to_bytes(declared).to_vec();

        let padding = (4 - declared % 4) % 4;
        if buf.remaining() < padding {
            return Err(FramingError::TruncatedAttribute {
                attr_type,
                declared: declared + padding,
                available: declared + buf.remaining(),
            }
            .into());
        }
        buf.advance(padding);

        match REGISTRY.lookup(attr_type) {
            Some(decode) => decode(attr_type, value, transaction_id),
            None => Ok(Self::Raw { attr_type, value }),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "0x{:04X}", self.attr_type())?,
        }
        match self {
            Self::Username(u) => write!(f, " {u:?}"),
            Self::Realm(r) => write!(f, " {r:?}"),
            Self::ErrorCode { code, reason } => write!(f, " {code} {reason}"),
            Self::XorMappedAddress(addr) => write!(f, " {addr}"),
            _ => write!(f, " ({} bytes)", self.value_len()),
        }
    }
}

/// Typed decode hook stored in the registry.
pub type DecodeFn = fn(u16, Vec<u8>, &TransactionId) -> StunResult<Attribute>;

struct RegistryEntry {
    name: &'static str,
    decode: DecodeFn,
}

struct Registry {
    entries: RwLock<HashMap<u16, RegistryEntry>>,
    sealed: AtomicBool,
}

impl Registry {
    fn seed(&self, attr_type: u16, name: &'static str, decode: DecodeFn) {
        self.entries
            .write()
            .insert(attr_type, RegistryEntry { name, decode });
    }

    fn lookup(&self, attr_type: u16) -> Option<DecodeFn> {
        // First dispatch seals the table; registration is configuration,
        // not request-time state.
        self.sealed.store(true, Ordering::Release);
        self.entries.read().get(&attr_type).map(|e| e.decode)
    }
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry {
        entries: RwLock::new(HashMap::new()),
        sealed: AtomicBool::new(false),
    };
    registry.seed(MAPPED_ADDRESS, "MAPPED-ADDRESS", decode_raw);
    registry.seed(USERNAME, "USERNAME", decode_username);
    registry.seed(MESSAGE_INTEGRITY, "MESSAGE-INTEGRITY", decode_message_integrity);
    registry.seed(ERROR_CODE, "ERROR-CODE", decode_error_code);
    registry.seed(UNKNOWN_ATTRIBUTES, "UNKNOWN-ATTRIBUTES", decode_raw);
    registry.seed(REALM, "REALM", decode_realm);
    registry.seed(NONCE, "NONCE", decode_nonce);
    registry.seed(XOR_MAPPED_ADDRESS, "XOR-MAPPED-ADDRESS", decode_xor_mapped_address);
    registry.seed(SOFTWARE, "SOFTWARE", decode_raw);
    registry.seed(ALTERNATE_SERVER, "ALTERNATE-SERVER", decode_raw);
    registry.seed(FINGERPRINT, "FINGERPRINT", decode_raw);
    registry
});

/// Register a typed decoder for an attribute type.
///
/// Registration is start-time configuration: it fails once any message has
/// been decoded, and it fails for a type that already has an entry.
pub fn register_attribute(attr_type: u16, name: &'static str, decode: DecodeFn) -> StunResult<()> {
    let registry = &*REGISTRY;
    if registry.sealed.load(Ordering::Acquire) {
        return Err(StunError::Configuration(
            "attribute registry is sealed after the first decode".into(),
        ));
    }
    match registry.entries.write().entry(attr_type) {
        Entry::Occupied(_) => Err(StunError::Configuration(format!(
            "attribute type 0x{attr_type:04X} is already registered"
        ))),
        Entry::Vacant(slot) => {
            slot.insert(RegistryEntry { name, decode });
            Ok(())
        }
    }
}

/// Registered name for an attribute type, if any.
pub fn attribute_name(attr_type: u16) -> Option<&'static str> {
    REGISTRY.entries.read().get(&attr_type).map(|e| e.name)
}

fn decode_raw(attr_type: u16, value: Vec<u8>, _tid: &TransactionId) -> StunResult<Attribute> {
    Ok(Attribute::Raw { attr_type, value })
}

fn decode_username(attr_type: u16, value: Vec<u8>, _tid: &TransactionId) -> StunResult<Attribute> {
    String::from_utf8(value).map(Attribute::Username).map_err(|_| {
        FramingError::AttributeParse {
            attr_type,
            reason: "value is not valid UTF-8".into(),
        }
        .into()
    })
}

fn decode_realm(attr_type: u16, value: Vec<u8>, _tid: &TransactionId) -> StunResult<Attribute> {
    String::from_utf8(value).map(Attribute::Realm).map_err(|_| {
        FramingError::AttributeParse {
            attr_type,
            reason: "value is not valid UTF-8".into(),
        }
        .into()
    })
}

fn decode_nonce(_attr_type: u16, value: Vec<u8>, _tid: &TransactionId) -> StunResult<Attribute> {
    Ok(Attribute::Nonce(value))
}

fn decode_message_integrity(
    _attr_type: u16,
    value: Vec<u8>,
    _tid: &TransactionId,
) -> StunResult<Attribute> {
    Ok(Attribute::MessageIntegrity(value))
}

fn decode_error_code(attr_type: u16, value: Vec<u8>, _tid: &TransactionId) -> StunResult<Attribute> {
    if value.len() < 4 {
        return Err(FramingError::AttributeParse {
            attr_type,
            reason: format!("ERROR-CODE needs at least 4 bytes, got {}", value.len()),
        }
        .into());
    }
    let code = value[2] as u16 * 100 + value[3] as u16;
    let reason = String::from_utf8_lossy(&value[4..]).into_owned();
    Ok(Attribute::ErrorCode { code, reason })
}

fn decode_xor_mapped_address(
    _attr_type: u16,
    value: Vec<u8>,
    tid: &TransactionId,
) -> StunResult<Attribute> {
    Ok(Attribute::XorMappedAddress(xor::deobfuscate(&value, tid)?))
}
