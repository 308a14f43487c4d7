use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::AuthError;

const SEALED_PREFIX: &str = "v1.";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256 bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Derives a key from arbitrary secret material, e.g. a private key file.
    pub fn derive(material: &[u8]) -> Self {
        Self(Sha256::digest(material).into())
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let key: [u8; 32] = raw.try_into().ok()?;
        Some(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.0).into())
    }

    /// AES-256-GCM encrypts `plaintext` into `v1.` + base64url(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, AuthError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AuthError::Internal("encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", URL_SAFE_NO_PAD.encode(out)))
    }

    /// None for anything that was not produced by `encrypt` with this key.
    pub fn decrypt(&self, sealed: &str) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD
            .decode(sealed.strip_prefix(SEALED_PREFIX)?)
            .ok()?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    exp: i64,
    payload: T,
}

/// Seals serializable values into opaque, expiry bounded strings.
#[derive(Clone, Debug)]
pub struct Sealer {
    key: SymmetricKey,
}

impl Sealer {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    pub fn seal<T: Serialize>(&self, value: &T, ttl: Duration) -> Result<String, AuthError> {
        self.seal_at(value, ttl, chrono::Utc::now().timestamp())
    }

    pub fn seal_at<T: Serialize>(
        &self,
        value: &T,
        ttl: Duration,
        now: i64,
    ) -> Result<String, AuthError> {
        let envelope = Envelope {
            exp: now + ttl.as_secs() as i64,
            payload: value,
        };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|err| AuthError::Internal(err.to_string()))?;
        self.key.encrypt(&plaintext)
    }

    pub fn open<T: DeserializeOwned>(&self, sealed: &str) -> Option<T> {
        self.open_at(sealed, chrono::Utc::now().timestamp())
    }

    pub fn open_at<T: DeserializeOwned>(&self, sealed: &str, now: i64) -> Option<T> {
        let plaintext = self.key.decrypt(sealed)?;
        let envelope: Envelope<T> = serde_json::from_slice(&plaintext).ok()?;
        (now < envelope.exp).then_some(envelope.payload)
    }
}
