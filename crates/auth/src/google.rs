use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::{config::GoogleAuthConfig, keys::KeySource, token::Claims, verifier::TokenVerifier};

pub const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

#[derive(Debug, Deserialize)]
struct GoogleIdToken {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
    email: Option<String>,
    /// Google has shipped both `true` and `"true"` here.
    email_verified: Option<Value>,
    hd: Option<String>,
}

impl GoogleIdToken {
    fn email_verified(&self) -> bool {
        match &self.email_verified {
            Some(Value::Bool(verified)) => *verified,
            Some(Value::String(verified)) => verified == "true",
            _ => false,
        }
    }
}

/// Verifies Google ID tokens against Google's published keys.
pub struct GoogleVerifier {
    config: GoogleAuthConfig,
    keys: Arc<dyn KeySource>,
}

impl GoogleVerifier {
    pub fn new(config: GoogleAuthConfig, keys: Arc<dyn KeySource>) -> Self {
        Self { config, keys }
    }

    fn accept(&self, token: GoogleIdToken) -> Option<Claims> {
        if !token.email_verified() {
            tracing::warn!("Rejecting Google token for {}: email not verified", token.sub);
            return None;
        }
        if let Some(domain) = &self.config.valid_domain {
            if token.hd.as_deref() != Some(domain.as_str()) {
                tracing::warn!(
                    "Rejecting Google token for {}: domain {:?} is not {domain}",
                    token.sub,
                    token.hd
                );
                return None;
            }
        }
        let username = if self.config.use_email_as_id {
            token.email.clone()?
        } else {
            token.sub.clone()
        };
        let mut extra = Map::new();
        extra.insert("sub".into(), token.sub.into());
        if let Some(email) = token.email {
            extra.insert("email".into(), email.into());
        }
        Some(Claims {
            iss: token.iss,
            username,
            iat: token.iat,
            exp: token.exp,
            refresh: false,
            scripting: false,
            extra,
        })
    }
}

#[async_trait]
impl TokenVerifier for GoogleVerifier {
    async fn verify(&self, token: &str) -> Option<Claims> {
        let header = decode_header(token).ok()?;
        let key = match self.keys.key_for(header.kid.as_deref()).await {
            Ok(key) => key,
            Err(err) => {
                tracing::error!("{err:?}");
                return None;
            }
        };
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_audience(&[&self.config.client_id]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        let data = decode::<GoogleIdToken>(token, &key, &validation)
            .map_err(|err| tracing::debug!("Google token rejected: {err}"))
            .ok()?;
        self.accept(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{decoding_key, encoding_key, StaticKey};
    use jsonwebtoken::{encode, Header};
    use serde_json::json;

    fn verifier(valid_domain: Option<&str>, use_email_as_id: bool) -> GoogleVerifier {
        let key =
            decoding_key(Algorithm::RS256, include_bytes!("../test_data/other_public.pem")).unwrap();
        GoogleVerifier::new(
            GoogleAuthConfig {
                client_id: "client-123.apps.googleusercontent.com".into(),
                valid_domain: valid_domain.map(String::from),
                use_email_as_id,
                user_lookup_table: None,
            },
            Arc::new(StaticKey(key)),
        )
    }

    fn google_token(overrides: Value) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut payload = json!({
            "iss": "https://accounts.google.com",
            "aud": "client-123.apps.googleusercontent.com",
            "sub": "10987654321",
            "email": "alice@example.org",
            "email_verified": true,
            "hd": "example.org",
            "iat": now,
            "exp": now + 3600,
        });
        if let (Some(base), Some(extra)) = (payload.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let key =
            encoding_key(Algorithm::RS256, include_bytes!("../test_data/other_private.pem")).unwrap();
        encode(&Header::new(Algorithm::RS256), &payload, &key).unwrap()
    }

    #[tokio::test]
    async fn sub_or_email_identifies_the_user() {
        let token = google_token(json!({}));
        assert_eq!(
            verifier(None, false).verify(&token).await.unwrap().username,
            "10987654321"
        );
        assert_eq!(
            verifier(None, true).verify(&token).await.unwrap().username,
            "alice@example.org"
        );
    }

    #[tokio::test]
    async fn unverified_email_is_rejected() {
        let token = google_token(json!({ "email_verified": "false" }));
        assert!(verifier(None, true).verify(&token).await.is_none());
        let token = google_token(json!({ "email_verified": "true" }));
        assert!(verifier(None, true).verify(&token).await.is_some());
    }

    #[tokio::test]
    async fn domain_restriction() {
        let token = google_token(json!({ "hd": "elsewhere.org" }));
        assert!(verifier(Some("example.org"), true).verify(&token).await.is_none());
        let token = google_token(json!({}));
        assert!(verifier(Some("example.org"), true).verify(&token).await.is_some());
    }

    #[tokio::test]
    async fn wrong_audience_or_issuer_is_rejected() {
        let token = google_token(json!({ "aud": "someone-else" }));
        assert!(verifier(None, false).verify(&token).await.is_none());
        let token = google_token(json!({ "iss": "https://evil.example.org" }));
        assert!(verifier(None, false).verify(&token).await.is_none());
    }
}
