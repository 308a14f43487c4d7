use async_trait::async_trait;
use jsonwebtoken::{jwk::JwkSet, Algorithm, DecodingKey, EncodingKey};
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::AuthError;

/// Minimum time between two JWKS downloads triggered by unknown key ids.
const JWKS_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

#[tracing::instrument(err)]
pub fn read_key_file(path: &Path) -> Result<Vec<u8>, AuthError> {
    std::fs::read(path).map_err(|err| {
        tracing::error!("{err:?}");
        AuthError::Key(format!("unable to read {}: {err}", path.display()))
    })
}

pub fn encoding_key(algorithm: Algorithm, pem: &[u8]) -> Result<EncodingKey, AuthError> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(EncodingKey::from_secret(pem)),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
    };
    key.map_err(|err| AuthError::Key(format!("invalid {algorithm:?} private key: {err}")))
}

pub fn decoding_key(algorithm: Algorithm, pem: &[u8]) -> Result<DecodingKey, AuthError> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(DecodingKey::from_secret(pem)),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
    };
    key.map_err(|err| AuthError::Key(format!("invalid {algorithm:?} public key: {err}")))
}

/// Where a verifier gets the key for a token it is about to check.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError>;
}

/// A single preconfigured key.
pub struct StaticKey(pub DecodingKey);

#[async_trait]
impl KeySource for StaticKey {
    async fn key_for(&self, _kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        Ok(self.0.clone())
    }
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Option<Instant>,
}

/// A published JSON Web Key Set, fetched lazily and refetched when a token
/// names a key id we have not seen.
pub struct RemoteJwks {
    client: reqwest::Client,
    uri: String,
    cache: RwLock<CachedJwks>,
}

impl RemoteJwks {
    pub fn new(client: reqwest::Client, uri: impl Into<String>) -> Self {
        Self {
            client,
            uri: uri.into(),
            cache: RwLock::new(CachedJwks {
                keys: JwkSet { keys: Vec::new() },
                fetched_at: None,
            }),
        }
    }

    #[tracing::instrument(skip(self), fields(uri = %self.uri), err)]
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.client
            .get(&self.uri)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AuthError::Upstream(err.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))
    }

    fn lookup(keys: &JwkSet, kid: Option<&str>) -> Option<Result<DecodingKey, AuthError>> {
        let jwk = match kid {
            Some(kid) => keys.find(kid),
            None => keys.keys.first(),
        }?;
        Some(
            DecodingKey::from_jwk(jwk)
                .map_err(|err| AuthError::Upstream(format!("unusable jwk: {err}"))),
        )
    }
}

#[async_trait]
impl KeySource for RemoteJwks {
    async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(key) = Self::lookup(&cache.keys, kid) {
                return key;
            }
        }
        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(key) = Self::lookup(&cache.keys, kid) {
            return key;
        }
        let recently_fetched = cache
            .fetched_at
            .is_some_and(|at| at.elapsed() < JWKS_REFETCH_INTERVAL);
        if recently_fetched {
            return Err(AuthError::Upstream(format!("unknown key id {kid:?}")));
        }
        cache.keys = self.fetch().await?;
        cache.fetched_at = Some(Instant::now());
        Self::lookup(&cache.keys, kid)
            .unwrap_or_else(|| Err(AuthError::Upstream(format!("unknown key id {kid:?}"))))
    }
}
