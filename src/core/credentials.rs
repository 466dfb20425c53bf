//! Provider credential resolution from the sealed `or_key` cookie.
//!
//! The cookie carries `base64url(nonce || ciphertext)` produced by
//! ChaCha20-Poly1305 under a key derived from the server secret.

use crate::core::error::ChatError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// ChaCha20-Poly1305 nonce length (96 bits).
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("sealed credential is not valid base64")]
    Encoding,
    #[error("sealed credential is too short")]
    Truncated,
    #[error("sealed credential failed authentication")]
    Tampered,
    #[error("sealed credential is not valid UTF-8")]
    NotUtf8,
    #[error("encryption failed")]
    Encrypt,
}

pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str, secret: &str) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SealedKeyCipher;

impl SealedKeyCipher {
    fn cipher(secret: &str) -> ChaCha20Poly1305 {
        let digest = Sha256::digest(secret.as_bytes());
        ChaCha20Poly1305::new(Key::from_slice(&digest))
    }

    pub fn seal(&self, plaintext: &str, secret: &str) -> Result<String, CredentialError> {
        let cipher = Self::cipher(secret);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }
}

impl CredentialDecryptor for SealedKeyCipher {
    fn decrypt(&self, ciphertext: &str, secret: &str) -> Result<String, CredentialError> {
        let blob = URL_SAFE_NO_PAD
            .decode(ciphertext.trim().trim_end_matches('='))
            .map_err(|_| CredentialError::Encoding)?;
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = Self::cipher(secret)
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CredentialError::Tampered)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::NotUtf8)
    }
}

/// Turns the cookie and secret into a provider API key.
pub fn resolve_api_key(
    decryptor: &dyn CredentialDecryptor,
    cookie: Option<&str>,
    secret: Option<&str>,
) -> Result<String, ChatError> {
    let cookie = cookie
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ChatError::Unauthenticated)?;
    let secret = secret
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ChatError::ServerMisconfigured("cookie secret is not set".to_string()))?;

    match decryptor.decrypt(cookie, secret) {
        Ok(api_key) if !api_key.trim().is_empty() => Ok(api_key),
        Ok(_) => Err(ChatError::Unauthenticated),
        Err(err) => {
            debug!(error = %err, "Stored provider credential could not be opened");
            Err(ChatError::Unauthenticated)
        }
    }
}
