// src/pkce.rs

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A Proof Key for Code Exchange pair, S256 only.
#[derive(Clone, Debug)]
pub struct Pkce {
    /// 86 URL-safe characters, kept server-side until the token exchange.
    pub code_verifier: String,
    /// `BASE64URL(SHA256(code_verifier))`, unpadded.
    pub code_challenge: String,
    pub code_challenge_method: &'static str,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        let code_verifier = URL_SAFE_NO_PAD.encode(bytes);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        Self {
            code_verifier,
            code_challenge,
            code_challenge_method: "S256",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let pkce = Pkce::generate();

        assert!(pkce.code_verifier.len() >= 43 && pkce.code_verifier.len() <= 128);
        assert!(pkce
            .code_verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn challenge_is_unpadded_sha256_of_verifier() {
        let pkce = Pkce::generate();

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.code_verifier.as_bytes()));
        assert_eq!(pkce.code_challenge, expected);
        assert!(!pkce.code_challenge.contains('='));
        assert_eq!(pkce.code_challenge_method, "S256");
    }

    #[test]
    fn pairs_are_unique() {
        let a = Pkce::generate();
        let b = Pkce::generate();

        assert_ne!(a.code_verifier, b.code_verifier);
        assert_ne!(a.code_challenge, b.code_challenge);
    }
}
