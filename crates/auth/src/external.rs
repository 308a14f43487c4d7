use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::{Map, Value};

use crate::{
    config::ExternalAuthConfig,
    keys::{decoding_key, read_key_file},
    token::Claims,
    verifier::TokenVerifier,
    AuthError,
};

/// Accepts tokens minted by an outside service that shares its public key
/// with us.
pub struct ExternalVerifier {
    config: ExternalAuthConfig,
    key: DecodingKey,
}

impl ExternalVerifier {
    pub fn new(config: ExternalAuthConfig, key: DecodingKey) -> Self {
        Self { config, key }
    }

    pub fn from_config(config: &ExternalAuthConfig) -> Result<Self, AuthError> {
        let pem = read_key_file(&config.public_key_location)?;
        let key = decoding_key(config.key_algorithm, &pem)?;
        Ok(Self::new(config.clone(), key))
    }

    pub fn issuers(&self) -> &[String] {
        &self.config.issuers
    }

    fn remap(&self, mut payload: Map<String, Value>) -> Option<Claims> {
        let username = match payload.remove(&self.config.unique_field)? {
            Value::String(username) => username,
            other => {
                tracing::warn!("Unusable {} claim {other}", self.config.unique_field);
                return None;
            }
        };
        let iss = payload.remove("iss")?.as_str()?.to_string();
        let exp = payload.remove("exp")?.as_i64()?;
        let iat = payload
            .remove("iat")
            .and_then(|iat| iat.as_i64())
            .unwrap_or_default();
        // Outside tokens never carry our own capability flags.
        payload.remove("username");
        payload.remove("refresh");
        payload.remove("scripting");
        Some(Claims {
            iss,
            username,
            iat,
            exp,
            refresh: false,
            scripting: false,
            extra: payload,
        })
    }
}

#[async_trait]
impl TokenVerifier for ExternalVerifier {
    async fn verify(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(self.config.key_algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&self.config.issuers);
        let data = decode::<Map<String, Value>>(token, &self.key, &validation)
            .map_err(|err| tracing::debug!("External token rejected: {err}"))
            .ok()?;
        self.remap(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::encoding_key;
    use jsonwebtoken::{encode, Algorithm, Header};
    use serde_json::json;

    fn verifier() -> ExternalVerifier {
        ExternalVerifier::new(
            ExternalAuthConfig {
                issuers: vec!["portal.example.org".into(), "sso.example.org".into()],
                public_key_location: "test_data/other_public.pem".into(),
                key_algorithm: Algorithm::RS256,
                unique_field: "preferred_username".into(),
                user_lookup_table: None,
            },
            decoding_key(Algorithm::RS256, include_bytes!("../test_data/other_public.pem")).unwrap(),
        )
    }

    fn sign(payload: Value) -> String {
        let key =
            encoding_key(Algorithm::RS256, include_bytes!("../test_data/other_private.pem")).unwrap();
        encode(&Header::new(Algorithm::RS256), &payload, &key).unwrap()
    }

    #[tokio::test]
    async fn remaps_unique_field() {
        let exp = chrono::Utc::now().timestamp() + 60;
        let token = sign(json!({
            "iss": "sso.example.org",
            "preferred_username": "alice",
            "scripting": true,
            "exp": exp,
        }));
        let claims = verifier().verify(&token).await.unwrap();
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iss, "sso.example.org");
        assert!(!claims.scripting);
    }

    #[tokio::test]
    async fn issuer_outside_allow_list() {
        let exp = chrono::Utc::now().timestamp() + 60;
        let token = sign(json!({ "iss": "rogue.example.org", "preferred_username": "alice", "exp": exp }));
        assert!(verifier().verify(&token).await.is_none());
    }

    #[tokio::test]
    async fn missing_unique_field() {
        let exp = chrono::Utc::now().timestamp() + 60;
        let token = sign(json!({ "iss": "sso.example.org", "sub": "alice", "exp": exp }));
        assert!(verifier().verify(&token).await.is_none());
    }
}
