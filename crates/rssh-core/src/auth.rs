//! Credential verification helpers
//!
//! These are the policy functions handed to the transport layer's
//! authentication callbacks. The comparison primitives themselves
//! (key parsing, fingerprints) come from russh-keys.

use russh_keys::key::PublicKey;

/// Compare an offered password against the configured one.
pub fn verify_password(expected: &str, offered: &str) -> bool {
    // Byte-wise comparison without early exit, so a rejected guess
    // does not leak the matching prefix length through timing.
    let expected = expected.as_bytes();
    let offered = offered.as_bytes();
    if expected.len() != offered.len() {
        return false;
    }
    expected
        .iter()
        .zip(offered.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Parse an `authorized_keys`-style line (`type base64 [comment]`).
pub fn parse_authorized_key(line: &str) -> Option<PublicKey> {
    let mut fields = line.split_whitespace();
    let _algo = fields.next()?;
    let encoded = fields.next()?;
    match russh_keys::parse_public_key_base64(encoded) {
        Ok(key) => Some(key),
        Err(err) => {
            tracing::warn!("Encountered error while parsing public key: {}", err);
            None
        }
    }
}

/// Compare an offered public key against the configured authorized
/// key line. An unset or unparseable line rejects every key.
pub fn verify_public_key(authorized: Option<&str>, offered: &PublicKey) -> bool {
    let Some(line) = authorized else {
        return false;
    };
    match parse_authorized_key(line) {
        Some(master) => master.fingerprint() == offered.fingerprint(),
        None => false,
    }
}
