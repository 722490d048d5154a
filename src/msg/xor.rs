//! XOR address obfuscation for XOR-MAPPED-ADDRESS.
//!
//! The reflexive address is XORed against protocol constants so NATs and
//! ALGs that rewrite literal addresses in payloads leave it intact. The
//! port is masked with the top 16 bits of the magic cookie; IPv4 addresses
//! with the 4 cookie bytes; IPv6 addresses with the cookie followed by the
//! 12-byte transaction id of the enclosing message's header.
//!
//! Both transforms operate on owned copies. Callers keep their parsed
//! attribute bytes untouched, which matters when the same wire bytes are
//! later fed back into integrity verification.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::FramingError;
use crate::msg::header::{TransactionId, MAGIC_COOKIE};

/// Family byte for a 4-byte address.
pub const FAMILY_IPV4: u8 = 0x01;
/// Family byte for a 16-byte address.
pub const FAMILY_IPV6: u8 = 0x02;

fn xor_port(port: u16) -> u16 {
    port ^ (MAGIC_COOKIE >> 16) as u16
}

/// Obfuscate an address into XOR-MAPPED-ADDRESS value bytes:
/// reserved byte, family byte, XORed port, XORed address.
pub fn obfuscate(addr: &SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut out = Vec::with_capacity(20);
    out.push(0);

    match addr {
        SocketAddr::V4(v4) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&xor_port(v4.port()).to_be_bytes());
            let mut octets = v4.ip().octets();
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            out.extend_from_slice(&octets);
        }
        SocketAddr::V6(v6) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&xor_port(v6.port()).to_be_bytes());
            let mut octets = v6.ip().octets();
            let tid = transaction_id.as_bytes();
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            for i in 0..12 {
                octets[i + 4] ^= tid[i];
            }
            out.extend_from_slice(&octets);
        }
    }

    out
}

/// Recover the address from XOR-MAPPED-ADDRESS value bytes. XOR is its own
/// inverse, so this applies the same masks `obfuscate` does.
pub fn deobfuscate(
    value: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, FramingError> {
    if value.len() < 8 {
        return Err(FramingError::AttributeParse {
            attr_type: super::attribute::XOR_MAPPED_ADDRESS,
            reason: format!("address value too short: {} bytes", value.len()),
        });
    }

    let family = value[1];
    let port = xor_port(u16::from_be_bytes([value[2], value[3]]));
    let cookie = MAGIC_COOKIE.to_be_bytes();

    match family {
        FAMILY_IPV4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(FramingError::AttributeParse {
                    attr_type: super::attribute::XOR_MAPPED_ADDRESS,
                    reason: format!("IPv6 address value too short: {} bytes", value.len()),
                });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            let tid = transaction_id.as_bytes();
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            for i in 0..12 {
                octets[i + 4] ^= tid[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(FramingError::InvalidAddressFamily(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_involution() {
        let tid = TransactionId::new();
        for addr in ["192.168.1.1:12345", "0.0.0.0:1", "255.255.255.255:65535"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let value = obfuscate(&addr, &tid);
            assert_eq!(value.len(), 8);
            assert_eq!(value[1], FAMILY_IPV4);
            assert_eq!(deobfuscate(&value, &tid).unwrap(), addr);
        }
    }

    #[test]
    fn ipv6_involution() {
        let tid = TransactionId::new();
        let addr: SocketAddr = "[2001:db8::dead:beef]:3478".parse().unwrap();
        let value = obfuscate(&addr, &tid);
        assert_eq!(value.len(), 20);
        assert_eq!(value[1], FAMILY_IPV6);
        assert_eq!(deobfuscate(&value, &tid).unwrap(), addr);
    }

    #[test]
    fn ipv6_mask_depends_on_transaction_id() {
        let addr: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let a = obfuscate(&addr, &TransactionId::from_bytes([1; 12]));
        let b = obfuscate(&addr, &TransactionId::from_bytes([2; 12]));
        assert_ne!(a, b);
        // The cookie-masked leading bytes are identical either way.
        assert_eq!(a[..8], b[..8]);
    }

    #[test]
    fn wire_bytes_differ_from_raw_address() {
        let tid = TransactionId::new();
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let value = obfuscate(&addr, &tid);
        assert_ne!(&value[4..8], &[10, 0, 0, 1]);
        assert_ne!(u16::from_be_bytes([value[2], value[3]]), 80);
    }

    #[test]
    fn deobfuscate_leaves_input_untouched() {
        let tid = TransactionId::new();
        let addr: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        let value = obfuscate(&addr, &tid);
        let snapshot = value.clone();
        let _ = deobfuscate(&value, &tid).unwrap();
        assert_eq!(value, snapshot);
    }

    #[test]
    fn rejects_unknown_family() {
        let tid = TransactionId::new();
        let value = vec![0, 0x03, 0, 0, 1, 2, 3, 4];
        assert!(matches!(
            deobfuscate(&value, &tid),
            Err(FramingError::InvalidAddressFamily(0x03))
        ));
    }
}
