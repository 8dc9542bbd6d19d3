//! Token encryption bound to a configured key
//!
//! Ciphertext layout (base64 encoded):
//!
//! ```text
//! [ version: 1 ][ nonce: 12 ][ tag: 16 ][ payload: n ]
//! ```
//!
//! A fresh random nonce is drawn for every call, so encrypting the same token
//! twice yields different ciphertexts. Decryption fails closed: a tag that does
//! not verify returns an error and never partial plaintext.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use sha2::{Digest, Sha256};

use crate::error::VaultError;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN + TAG_LEN;
const KEY_LEN: usize = 32;

pub struct TokenCipher {
    cipher: ChaCha20Poly1305,
    key_id: String,
}

impl TokenCipher {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

        // Short fingerprint so logs can tell keys apart during rotation
        let key_id = hex::encode(&Sha256::digest(key)[..4]);

        Ok(Self { cipher, key_id })
    }

    /// Build from a base64-encoded 32-byte key (the `TOKEN_ENCRYPTION_KEY` format)
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(format!("invalid base64: {}", e)))?;
        Self::new(&key)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut payload = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, &[VERSION], &mut payload)
            .map_err(|_| VaultError::Encryption)?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(tag.as_slice());
        out.extend_from_slice(&payload);

        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| VaultError::MalformedCiphertext(format!("invalid base64: {}", e)))?;

        if raw.len() < HEADER_LEN {
            return Err(VaultError::MalformedCiphertext(format!(
                "expected at least {} bytes, got {}",
                HEADER_LEN,
                raw.len()
            )));
        }

        if raw[0] != VERSION {
            return Err(VaultError::UnsupportedVersion(raw[0]));
        }

        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        let tag = Tag::from_slice(&raw[1 + NONCE_LEN..HEADER_LEN]);
        let mut payload = raw[HEADER_LEN..].to_vec();

        self.cipher
            .decrypt_in_place_detached(nonce, &[VERSION], &mut payload, tag)
            .map_err(|_| VaultError::Decryption)?;

        String::from_utf8(payload)
            .map_err(|e| VaultError::MalformedCiphertext(format!("plaintext is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let cipher = cipher();
        let sealed = cipher.encrypt("access-token-123").unwrap();
        assert_ne!(sealed, "access-token-123");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "access-token-123");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_fails_closed() {
        let cipher = cipher();
        let sealed = cipher.encrypt("refresh-token").unwrap();
        let mut raw = STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let result = cipher.decrypt(&STANDARD.encode(raw));
        assert!(matches!(result, Err(VaultError::Decryption)));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sealed = cipher().encrypt("token").unwrap();
        let other = TokenCipher::new(&[9u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(VaultError::Decryption)));
        assert_ne!(cipher().key_id(), other.key_id());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let result = cipher().decrypt(&STANDARD.encode([VERSION, 1, 2, 3]));
        assert!(matches!(result, Err(VaultError::MalformedCiphertext(_))));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            TokenCipher::new(&[1u8; 16]),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(TokenCipher::from_base64(&STANDARD.encode([3u8; 32])).is_ok());
    }
}
