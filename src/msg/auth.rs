// src/msg/auth.rs
//! Long-term credential message integrity and nonce lifetime management.
//!
//! The key derivation is the protocol-mandated `MD5(username:realm:password)`
//! of RFC 5389 section 15.4 - an interoperability requirement, not a strength
//! claim. The digest itself is HMAC-SHA256 over the canonical signing copy of
//! the message (the message with MESSAGE-INTEGRITY and FINGERPRINT removed
//! and the length field recomputed as if they were never appended).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

use crate::msg::attribute::{Attribute, MESSAGE_INTEGRITY};
use crate::msg::Message;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of checking a message's MESSAGE-INTEGRITY attribute.
///
/// `Missing` and `Invalid` are deliberately distinct: an absent attribute
/// triggers a challenge, a wrong one is a hard authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// The message carries no MESSAGE-INTEGRITY attribute.
    Missing,
    /// The attribute verified against the supplied credentials.
    Valid,
    /// The attribute is present but does not match.
    Invalid,
}

/// Derive the 16-byte long-term credential key.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Compute the MESSAGE-INTEGRITY digest for a message.
///
/// The hash covers the canonical signing copy, so the message may already
/// carry a MESSAGE-INTEGRITY attribute (it is ignored) and is never mutated.
pub fn compute_integrity(
    username: &str,
    password: &str,
    realm: &str,
    message: &Message,
) -> Vec<u8> {
    let key = long_term_key(username, realm, password);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
    mac.update(&message.integrity_base().encode());
    mac.finalize().into_bytes().to_vec()
}

/// Verify a message's MESSAGE-INTEGRITY attribute against credentials,
/// comparing digests in constant time.
pub fn verify_integrity(
    username: &str,
    password: &str,
    realm: &str,
    message: &Message,
) -> IntegrityOutcome {
    let stored = match message.attribute(MESSAGE_INTEGRITY) {
        None => return IntegrityOutcome::Missing,
        Some(Attribute::MessageIntegrity(mac)) => mac.as_slice(),
        Some(Attribute::Raw { value, .. }) => value.as_slice(),
        Some(_) => return IntegrityOutcome::Invalid,
    };
    let expected = compute_integrity(username, password, realm, message);
    if constant_time_eq(stored, &expected) {
        IntegrityOutcome::Valid
    } else {
        IntegrityOutcome::Invalid
    }
}

/// Constant-time equality comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Default nonce lifetime.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(60);

/// Mints time-bounded nonces and checks their expiry.
///
/// A nonce is the expiry instant as 8 big-endian bytes of Unix seconds. The
/// server is the sole writer; clients return it unmodified. Anything that
/// fails to decode is treated as expired.
#[derive(Debug, Clone)]
pub struct NonceIssuer {
    lifetime: Duration,
}

impl Default for NonceIssuer {
    fn default() -> Self {
        Self::new(NONCE_LIFETIME)
    }
}

impl NonceIssuer {
    /// Create an issuer with the given lifetime.
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }

    /// Mint a nonce expiring `lifetime` from now.
    pub fn mint(&self) -> Vec<u8> {
        let expiry = SystemTime::now() + self.lifetime;
        encode_expiry(expiry)
    }

    /// Whether a nonce's embedded expiry is still in the future. Fails
    /// closed: malformed input is invalid.
    pub fn is_valid(nonce: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 8]>::try_from(nonce) else {
            return false;
        };
        let expiry_secs = u64::from_be_bytes(bytes);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        expiry_secs > now
    }
}

fn encode_expiry(expiry: SystemTime) -> Vec<u8> {
    let secs = expiry
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    secs.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MessageType;

    fn signed_message() -> Message {
        let mut msg = Message::new_request(MessageType::BINDING_REQUEST);
        msg.add_attribute(Attribute::username("alice").unwrap());
        msg.add_attribute(Attribute::realm("example.org").unwrap());
        msg.add_attribute(Attribute::nonce(vec![9; 8]));
        let mac = compute_integrity("alice", "secret", "example.org", &msg);
        msg.add_attribute(Attribute::message_integrity(mac));
        msg
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = long_term_key("alice", "example.org", "secret");
        let b = long_term_key("alice", "example.org", "secret");
        assert_eq!(a, b);
        assert_ne!(a, long_term_key("alice", "example.org", "secre t"));
        assert_ne!(a, long_term_key("alice", "example.com", "secret"));
    }

    #[test]
    fn integrity_verifies_round_trip() {
        let msg = signed_message();
        assert_eq!(
            verify_integrity("alice", "secret", "example.org", &msg),
            IntegrityOutcome::Valid
        );
    }

    #[test]
    fn integrity_rejects_wrong_password() {
        let msg = signed_message();
        assert_eq!(
            verify_integrity("alice", "wrong", "example.org", &msg),
            IntegrityOutcome::Invalid
        );
    }

    #[test]
    fn integrity_missing_is_reported_distinctly() {
        let msg = Message::new_request(MessageType::BINDING_REQUEST);
        assert_eq!(
            verify_integrity("alice", "secret", "example.org", &msg),
            IntegrityOutcome::Missing
        );
    }

    #[test]
    fn integrity_detects_tampered_message() {
        let mut msg = signed_message();
        // Flip a byte in an attribute that precedes the digest.
        if let Some(Attribute::Nonce(nonce)) =
            msg.attributes_mut().iter_mut().find(|a| a.attr_type() == crate::msg::attribute::NONCE)
        {
            nonce[0] ^= 0x01;
        }
        assert_eq!(
            verify_integrity("alice", "secret", "example.org", &msg),
            IntegrityOutcome::Invalid
        );
    }

    #[test]
    fn integrity_detects_single_bit_flip_in_mac() {
        let mut msg = signed_message();
        if let Some(Attribute::MessageIntegrity(mac)) = msg
            .attributes_mut()
            .iter_mut()
            .find(|a| a.attr_type() == MESSAGE_INTEGRITY)
        {
            mac[0] ^= 0x01;
        }
        assert_eq!(
            verify_integrity("alice", "secret", "example.org", &msg),
            IntegrityOutcome::Invalid
        );
    }

    #[test]
    fn minted_nonce_is_valid() {
        let issuer = NonceIssuer::default();
        assert!(NonceIssuer::is_valid(&issuer.mint()));
    }

    #[test]
    fn nonce_expiry_boundary() {
        let now = SystemTime::now();
        // A 60s nonce minted 59s ago is still valid; minted 61s ago it is
        // past its boundary.
        let minted_59s_ago = encode_expiry(now - Duration::from_secs(59) + NONCE_LIFETIME);
        let minted_61s_ago = encode_expiry(now - Duration::from_secs(61) + NONCE_LIFETIME);
        assert!(NonceIssuer::is_valid(&minted_59s_ago));
        assert!(!NonceIssuer::is_valid(&minted_61s_ago));
    }

    #[test]
    fn malformed_nonce_fails_closed() {
        assert!(!NonceIssuer::is_valid(b""));
        assert!(!NonceIssuer::is_valid(b"short"));
        assert!(!NonceIssuer::is_valid(&[0xFF; 9]));
        assert!(!NonceIssuer::is_valid(&[0; 8]));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
    }
}
