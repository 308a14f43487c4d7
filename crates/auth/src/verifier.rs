use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::{
    token::{peek_issuer, Claims, TokenCodec},
    user_map::UserMap,
};

/// Resolves a raw token to a verified claim set. `None` means the caller is
/// simply not authenticated.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Claims>;
}

#[async_trait]
impl TokenVerifier for TokenCodec {
    async fn verify(&self, token: &str) -> Option<Claims> {
        TokenCodec::verify(self, token)
    }
}

/// Verifiers keyed by the issuer they accept, plus the optional per-issuer
/// user lookup tables.
#[derive(Clone, Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<String, Arc<dyn TokenVerifier>>,
    user_maps: HashMap<String, UserMap>,
}

impl VerifierRegistry {
    pub fn register(&mut self, issuer: impl Into<String>, verifier: Arc<dyn TokenVerifier>) {
        let issuer = issuer.into();
        tracing::info!("Registered token verifier for issuer {issuer}");
        self.verifiers.insert(issuer, verifier);
    }

    pub fn register_user_map(&mut self, issuer: impl Into<String>, map: UserMap) {
        self.user_maps.insert(issuer.into(), map);
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.verifiers.keys().map(String::as_str)
    }

    /// Dispatches on the token's `iss` claim. Unknown issuers are rejected.
    pub async fn verify(&self, token: &str) -> Option<Claims> {
        let issuer = peek_issuer(token)?;
        let Some(verifier) = self.verifiers.get(&issuer) else {
            tracing::debug!("No verifier registered for issuer {issuer}");
            return None;
        };
        let claims = verifier.verify(token).await?;
        // A verifier must never vouch for another issuer's token.
        (claims.iss == issuer).then_some(claims)
    }

    /// Identity when the issuer has no user table. With a table, a missing
    /// entry means the user may not use this server.
    pub fn local_username(&self, claims: &Claims) -> Option<String> {
        match self.user_maps.get(&claims.iss) {
            Some(map) => {
                let mapped = map.lookup(&claims.username);
                if mapped.is_none() {
                    tracing::warn!(
                        "Could not find username {} in the user map for {}",
                        claims.username,
                        claims.iss
                    );
                }
                mapped
            }
            None => Some(claims.username.clone()),
        }
    }
}
