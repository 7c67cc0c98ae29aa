//! Registration nonce.
//!
//! The expected nonce is a double MD5 digest over the realm and the shared
//! hash key: `md5(md5(realm ‖ hash_key))`. The raw digest is carried as
//! standard base64 so both sides compare the same canonical text.

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// Compute the nonce a unit must present for `realm` and `hash_key`.
pub fn expected_nonce(realm: &str, hash_key: &str) -> String {
    let mut context = md5::Context::new();
    context.consume(realm.as_bytes());
    context.consume(hash_key.as_bytes());
    let a1 = context.compute();
    let a2 = md5::compute(a1.0);
    BASE64_STANDARD.encode(a2.0)
}

/// Checks presented nonces against the configured realm and hash key.
///
/// The expected value is computed once; every check is a constant-time
/// comparison of the base64 text.
#[derive(Clone)]
pub struct NonceVerifier {
    expected: String,
}

impl NonceVerifier {
    pub fn new(realm: &str, hash_key: &str) -> Self {
        NonceVerifier {
            expected: expected_nonce(realm, hash_key),
        }
    }

    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.expected.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }
}

impl std::fmt::Debug for NonceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_double_digest() {
        let inner = md5::compute(b"streamingsecret123");
        let outer = md5::compute(inner.0);
        assert_eq!(
            expected_nonce("streaming", "secret123"),
            BASE64_STANDARD.encode(outer.0)
        );
    }

    #[test]
    fn nonce_is_canonical_base64() {
        let nonce = expected_nonce("streaming", "secret123");
        // 16 digest bytes -> 24 base64 chars with padding.
        assert_eq!(nonce.len(), 24);
        assert!(nonce.ends_with("=="));
        assert_eq!(BASE64_STANDARD.decode(&nonce).unwrap().len(), 16);
    }

    #[test]
    fn nonce_depends_on_realm_and_key() {
        let base = expected_nonce("streaming", "secret123");
        assert_ne!(base, expected_nonce("streaming", "secret124"));
        assert_ne!(base, expected_nonce("other", "secret123"));
    }

    #[test]
    fn verifier_accepts_only_expected() {
        let verifier = NonceVerifier::new("streaming", "secret123");
        assert!(verifier.verify(&expected_nonce("streaming", "secret123")));
        assert!(!verifier.verify("garbage"));
        assert!(!verifier.verify(""));
    }

    #[test]
    fn debug_does_not_leak_nonce() {
        let verifier = NonceVerifier::new("streaming", "secret123");
        assert!(!format!("{verifier:?}").contains(verifier.expected()));
    }
}
