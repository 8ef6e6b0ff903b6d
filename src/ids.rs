//! Identifier generators and the subdomain grammar.
//!
//! Three disjoint alphabets are contractual — clients display these values:
//!
//! - subdomain: lowercase alphanumeric, length 8
//! - request identifier: lowercase hex, length 16
//! - tunnel identifier: mixed-case alphanumeric, length 12
//!
//! All generators draw from `rand::thread_rng()` (OS-seeded CSPRNG).
//! Collision retry is the caller's job: the loop that owns the live index
//! generates, tests, and retries.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generated subdomain length.
pub const SUBDOMAIN_LEN: usize = 8;
/// Request identifier length (hex characters).
pub const REQUEST_ID_LEN: usize = 16;
/// Tunnel identifier length.
pub const TUNNEL_ID_LEN: usize = 12;

/// Labels the gateway never assigns to a tunnel.
pub const RESERVED_SUBDOMAINS: &[&str] =
    &["api", "www", "admin", "dashboard", "app", "mail", "ftp"];

const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase-alphanumeric subdomain of length 8.
pub fn generate_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SUBDOMAIN_CHARSET.len());
            SUBDOMAIN_CHARSET[idx] as char
        })
        .collect()
}

/// Random 16-character lowercase-hex request identifier.
pub fn generate_request_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// Random 12-character mixed-case alphanumeric tunnel identifier.
pub fn generate_tunnel_id() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(TUNNEL_ID_LEN)
        .map(char::from)
        .collect()
}

/// Check a label against the subdomain grammar:
/// `[a-z0-9][a-z0-9-]*[a-z0-9]`, length 4–32.
///
/// Callers case-fold before validating; uppercase input fails here.
#[must_use]
pub fn is_valid_subdomain(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.len() < 4 || bytes.len() > 32 {
        return false;
    }
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    inner_ok && edge_ok(bytes[0]) && edge_ok(bytes[bytes.len() - 1])
}

/// Whether a label is in the reserved set.
#[must_use]
pub fn is_reserved(label: &str) -> bool {
    RESERVED_SUBDOMAINS.contains(&label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn subdomain_has_contractual_shape() {
        for _ in 0..100 {
            let s = generate_subdomain();
            assert_eq!(s.len(), SUBDOMAIN_LEN);
            assert!(s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
            assert!(is_valid_subdomain(&s));
        }
    }

    #[test]
    fn request_id_is_lowercase_hex() {
        for _ in 0..100 {
            let id = generate_request_id();
            assert_eq!(id.len(), REQUEST_ID_LEN);
            assert!(id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }
    }

    #[test]
    fn tunnel_id_is_mixed_case_alphanumeric() {
        for _ in 0..100 {
            let id = generate_tunnel_id();
            assert_eq!(id.len(), TUNNEL_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn generated_ids_do_not_collide_in_practice() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn grammar_length_boundaries() {
        assert!(!is_valid_subdomain("abc")); // 3 rejected
        assert!(is_valid_subdomain("abcd")); // 4 accepted
        assert!(is_valid_subdomain(&"a".repeat(32))); // 32 accepted
        assert!(!is_valid_subdomain(&"a".repeat(33))); // 33 rejected
    }

    #[test]
    fn grammar_dash_placement() {
        assert!(!is_valid_subdomain("-abcd"));
        assert!(!is_valid_subdomain("abcd-"));
        assert!(is_valid_subdomain("ab-cd"));
    }

    #[test]
    fn grammar_rejects_uppercase_and_symbols() {
        assert!(!is_valid_subdomain("Demo1"));
        assert!(!is_valid_subdomain("ab.cd"));
        assert!(!is_valid_subdomain("ab_cd"));
    }

    #[test]
    fn reserved_set_contains_expected_labels() {
        for label in ["api", "www", "admin", "dashboard", "app", "mail", "ftp"] {
            assert!(is_reserved(label));
        }
        assert!(!is_reserved("hello42"));
    }
}
