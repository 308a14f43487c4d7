use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{ops::Not, time::Duration};

use crate::{
    config::SigningConfig,
    crypto::{Sealer, SymmetricKey},
    keys::{decoding_key, encoding_key, read_key_file},
    AuthError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
    Scripting,
}

/// The claim set carried by every token the broker mints or accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Not::not")]
    pub refresh: bool,
    #[serde(default, skip_serializing_if = "Not::not")]
    pub scripting: bool,
    /// Provider specific claims (email, sub, groups...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn kind(&self) -> TokenKind {
        if self.refresh {
            TokenKind::Refresh
        } else if self.scripting {
            TokenKind::Scripting
        } else {
            TokenKind::Access
        }
    }

    /// Seconds of validity left at `now`.
    pub fn remaining(&self, now: i64) -> i64 {
        self.exp - now
    }
}

/// Reads the `iss` claim without checking anything, to pick a verifier.
pub fn peek_issuer(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Issuer {
        iss: String,
    }
    let payload = token.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice::<Issuer>(&raw).ok().map(|i| i.iss)
}

/// Signs and verifies tokens for one issuer, and seals opaque values with a
/// key derived from the issuer's private key.
pub struct TokenCodec {
    issuer: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    sealer: Sealer,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(
        issuer: impl Into<String>,
        algorithm: Algorithm,
        private_pem: &[u8],
        public_pem: &[u8],
    ) -> Result<Self, AuthError> {
        Ok(Self {
            issuer: issuer.into(),
            algorithm,
            encoding_key: encoding_key(algorithm, private_pem)?,
            decoding_key: decoding_key(algorithm, public_pem)?,
            sealer: Sealer::new(SymmetricKey::derive(private_pem)),
        })
    }

    pub fn from_config(config: &SigningConfig) -> Result<Self, AuthError> {
        let private_pem = read_key_file(&config.private_key_location)?;
        let public_pem = read_key_file(&config.public_key_location)?;
        Self::new(
            config.issuer.clone(),
            config.key_algorithm,
            &private_pem,
            &public_pem,
        )
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn claims(&self, username: &str, kind: TokenKind, ttl: Duration) -> Claims {
        self.claims_at(username, kind, ttl, chrono::Utc::now().timestamp())
    }

    pub fn claims_at(&self, username: &str, kind: TokenKind, ttl: Duration, now: i64) -> Claims {
        Claims {
            iss: self.issuer.clone(),
            username: username.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            refresh: kind == TokenKind::Refresh,
            scripting: kind == TokenKind::Scripting,
            extra: Map::new(),
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|err| AuthError::Key(format!("unable to sign token: {err}")))
    }

    pub fn issue(&self, username: &str, kind: TokenKind, ttl: Duration) -> Result<String, AuthError> {
        self.sign(&self.claims(username, kind, ttl))
    }

    pub fn verify(&self, token: &str) -> Option<Claims> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Signature, issuer and expiry check. Expiry is exact: a token is dead
    /// at `exp`.
    pub fn verify_at(&self, token: &str, now: i64) -> Option<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) if now < data.claims.exp => Some(data.claims),
            Ok(_) => {
                tracing::debug!(issuer = self.issuer, "token expired");
                None
            }
            Err(err) => {
                tracing::debug!(issuer = self.issuer, "token rejected: {err}");
                None
            }
        }
    }

    pub fn seal<T: Serialize>(&self, value: &T, ttl: Duration) -> Result<String, AuthError> {
        self.sealer.seal(value, ttl)
    }

    pub fn unseal<T: DeserializeOwned>(&self, sealed: &str) -> Option<T> {
        self.sealer.open(sealed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn test_codec(issuer: &str) -> TokenCodec {
        TokenCodec::new(
            issuer,
            Algorithm::RS256,
            include_bytes!("../test_data/local_private.pem"),
            include_bytes!("../test_data/local_public.pem"),
        )
        .unwrap()
    }

    pub fn other_codec(issuer: &str) -> TokenCodec {
        TokenCodec::new(
            issuer,
            Algorithm::RS256,
            include_bytes!("../test_data/other_private.pem"),
            include_bytes!("../test_data/other_public.pem"),
        )
        .unwrap()
    }

    #[test]
    fn verify_until_expiry() {
        let codec = test_codec("broker");
        let iat = 1_700_000_000;
        let mut claims = codec.claims_at("alice", TokenKind::Access, Duration::from_secs(900), iat);
        claims.extra.insert("email".into(), "alice@example.org".into());
        let token = codec.sign(&claims).unwrap();

        assert_eq!(codec.verify_at(&token, iat), Some(claims.clone()));
        assert_eq!(codec.verify_at(&token, iat + 899), Some(claims));
        assert_eq!(codec.verify_at(&token, iat + 900), None);
    }

    #[test]
    fn token_kinds_round_trip() {
        let codec = test_codec("broker");
        for kind in [TokenKind::Access, TokenKind::Refresh, TokenKind::Scripting] {
            let token = codec.issue("bob", kind, Duration::from_secs(60)).unwrap();
            assert_eq!(codec.verify(&token).unwrap().kind(), kind);
        }
    }

    #[test]
    fn rejects_foreign_issuer_and_key() {
        let ours = test_codec("broker");
        let same_key_other_issuer = test_codec("somebody-else");
        let other_key_same_issuer = other_codec("broker");

        let token = same_key_other_issuer
            .issue("alice", TokenKind::Access, Duration::from_secs(60))
            .unwrap();
        assert_eq!(ours.verify(&token), None);

        let token = other_key_same_issuer
            .issue("alice", TokenKind::Access, Duration::from_secs(60))
            .unwrap();
        assert_eq!(ours.verify(&token), None);
    }

    #[test]
    fn malformed_input_is_a_rejection() {
        let codec = test_codec("broker");
        for garbage in ["", "a.b", "a.b.c", "not a token at all"] {
            assert_eq!(codec.verify(garbage), None);
        }
    }

    #[test]
    fn peeks_issuer() {
        let codec = test_codec("https://accounts.example.org");
        let token = codec
            .issue("alice", TokenKind::Access, Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            peek_issuer(&token).as_deref(),
            Some("https://accounts.example.org")
        );
        assert_eq!(peek_issuer("x.!!!.y"), None);
    }

    #[test]
    fn seals_with_private_key_material() {
        let codec = test_codec("broker");
        let sealed = codec
            .seal(&("alice", "session-1"), Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            codec.unseal::<(String, String)>(&sealed),
            Some(("alice".to_string(), "session-1".to_string()))
        );
        assert_eq!(other_codec("broker").unseal::<(String, String)>(&sealed), None);
    }
}
