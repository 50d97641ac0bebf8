//! Inbound `?token=` handling.
//!
//! Clients carry their upstream access token sealed with ChaCha20-Poly1305:
//! URL-safe base64 (no padding) of a 12-byte nonce followed by the
//! ciphertext. Without a configured key the token is taken verbatim.

use std::path::Path;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, SecretBox};

use strider_core::Identity;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no token")]
    Missing,
    #[error("invalid token encoding")]
    InvalidEncoding,
    #[error("token could not be opened")]
    DecryptionFailed,
    #[error("sealing failed")]
    EncryptionFailed,
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Turns the raw query token into an [`Identity`], and back.
pub trait TokenDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<Identity, TokenError>;

    /// The token a client should present for `identity`.
    fn seal(&self, identity: &Identity) -> Result<String, TokenError>;
}

/// Accepts any non-blank token as the identity itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTokenDecoder;

impl TokenDecoder for PlainTokenDecoder {
    fn decode(&self, raw: &str) -> Result<Identity, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(Identity::new(raw))
    }

    fn seal(&self, identity: &Identity) -> Result<String, TokenError> {
        Ok(identity.expose().to_string())
    }
}

pub struct SealedTokenDecoder {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl SealedTokenDecoder {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Read a standard-base64 32-byte key from `path`.
    pub fn from_key_file(path: &Path) -> Result<Self, TokenError> {
        let encoded = std::fs::read_to_string(path)
            .map_err(|e| TokenError::InvalidKey(format!("{}: {e}", path.display())))?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| TokenError::InvalidKey("key is not base64".into()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| TokenError::InvalidKey(format!("key must be {KEY_LEN} bytes")))?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(self.key.expose_secret().into())
    }
}

impl TokenDecoder for SealedTokenDecoder {
    fn decode(&self, raw: &str) -> Result<Identity, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Missing);
        }
        let combined = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| TokenError::InvalidEncoding)?;
        if combined.len() <= NONCE_LEN {
            return Err(TokenError::InvalidEncoding);
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::DecryptionFailed)?;
        let token = String::from_utf8(plaintext).map_err(|_| TokenError::InvalidEncoding)?;
        if token.trim().is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(Identity::new(token))
    }

    fn seal(&self, identity: &Identity) -> Result<String, TokenError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, identity.expose().as_bytes())
            .map_err(|_| TokenError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(combined))
    }
}
