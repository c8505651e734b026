//! Device fingerprints and network comparison

use std::net::IpAddr;

use sha2::{Digest, Sha256};

use crate::session::RequestContext;

/// Length in hex characters of a device fingerprint.
pub const FINGERPRINT_LENGTH: usize = 32;

/// Derive a device fingerprint from the request's IP and client headers.
///
/// The fingerprint is a pure function of (IP, user agent, accept-language,
/// accept-encoding). Each field is length-prefixed before hashing so that
/// shifting text between fields always changes the result. Missing headers
/// hash as empty strings.
pub fn generate_device_fingerprint(context: &RequestContext) -> String {
    let mut hasher = Sha256::new();
    for field in [
        Some(context.ip.as_str()),
        context.user_agent.as_deref(),
        context.accept_language.as_deref(),
        context.accept_encoding.as_deref(),
    ] {
        let value = field.unwrap_or_default().as_bytes();
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_LENGTH / 2])
}

/// Whether two addresses fall in the same network segment.
///
/// IPv4 addresses are compared on their first `ipv4_prefix` bits, IPv6 on
/// their first `ipv6_prefix` bits. IPv4-mapped IPv6 addresses are treated as
/// IPv4. Mixed families and unparseable input never match.
pub fn is_same_network(old_ip: &str, new_ip: &str, ipv4_prefix: u8, ipv6_prefix: u8) -> bool {
    let (Ok(old), Ok(new)) = (old_ip.trim().parse::<IpAddr>(), new_ip.trim().parse::<IpAddr>())
    else {
        return false;
    };

    match (old.to_canonical(), new.to_canonical()) {
        (IpAddr::V4(old), IpAddr::V4(new)) => {
            let prefix = u32::from(ipv4_prefix.min(32));
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(old) & mask == u32::from(new) & mask
        }
        (IpAddr::V6(old), IpAddr::V6(new)) => {
            let prefix = u32::from(ipv6_prefix.min(128));
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(old) & mask == u128::from(new) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RequestContext {
        RequestContext::new("10.0.0.1")
            .with_user_agent("Mozilla/5.0")
            .with_accept_language("en-US")
            .with_accept_encoding("gzip")
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = generate_device_fingerprint(&context());
        let b = generate_device_fingerprint(&context());
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_depends_on_every_signal() {
        let base = generate_device_fingerprint(&context());
        let variants = [
            RequestContext {
                ip: "10.0.0.2".to_string(),
                ..context()
            },
            context().with_user_agent("curl/8.0"),
            context().with_accept_language("fr-FR"),
            context().with_accept_encoding("br"),
        ];
        for variant in variants {
            assert_ne!(generate_device_fingerprint(&variant), base);
        }
    }

    #[test]
    fn test_fingerprint_fields_do_not_bleed() {
        let a = RequestContext::new("10.0.0.1").with_user_agent("ab");
        let b = RequestContext::new("10.0.0.1")
            .with_user_agent("a")
            .with_accept_language("b");
        assert_ne!(
            generate_device_fingerprint(&a),
            generate_device_fingerprint(&b)
        );
    }

    #[test]
    fn test_same_network_ipv4() {
        assert!(is_same_network("192.168.1.10", "192.168.1.200", 24, 64));
        assert!(!is_same_network("192.168.1.10", "192.168.2.10", 24, 64));
        assert!(is_same_network("192.168.1.10", "192.168.2.10", 16, 64));
        assert!(is_same_network("1.2.3.4", "9.9.9.9", 0, 64));
    }

    #[test]
    fn test_same_network_ipv6() {
        assert!(is_same_network("2001:db8::1", "2001:db8::ffff", 24, 64));
        assert!(!is_same_network("2001:db8:0:1::1", "2001:db8:0:2::1", 24, 64));
    }

    #[test]
    fn test_same_network_mixed_or_invalid() {
        assert!(!is_same_network("10.0.0.1", "2001:db8::1", 24, 64));
        assert!(!is_same_network("not-an-ip", "10.0.0.1", 24, 64));
        assert!(is_same_network("::ffff:10.0.0.1", "10.0.0.99", 24, 64));
    }
}
