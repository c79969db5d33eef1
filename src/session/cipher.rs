//! Authenticated encryption for session token fields

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
};
use rand::RngExt;
use sha2::{Digest, Sha256};

use super::SessionError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed from the cookie secret
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Derive a cipher from the configured cookie secret.
    ///
    /// A secret that is valid base64 of a 16, 24 or 32 byte key is decoded
    /// first; anything else is used as raw bytes. The AES key is the SHA-256
    /// of the result.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let bytes = secret_bytes(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(&bytes));
        Self { key }
    }

    fn aead(&self) -> Result<Aes256Gcm, SessionError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| SessionError::Crypto(e.to_string()))
    }

    /// Encrypt `plaintext` into `base64url(nonce || ciphertext || tag)`
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SessionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| SessionError::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(&blob))
    }

    /// Reverse of [`Cipher::encrypt`]; fails on any tampering
    pub fn decrypt(&self, encoded: &str) -> Result<String, SessionError> {
        let blob = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SessionError::Crypto(format!("failed to decode value: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(SessionError::Crypto("encrypted value too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Crypto("value is invalid or tampered".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| SessionError::Crypto(format!("decrypted value is not UTF-8: {e}")))
    }
}

fn secret_bytes(secret: &str) -> Vec<u8> {
    for engine in [&URL_SAFE, &STANDARD] {
        if let Ok(decoded) = engine.decode(secret) {
            if matches!(decoded.len(), 16 | 24 | 32) {
                return decoded;
            }
        }
    }
    secret.as_bytes().to_vec()
}
