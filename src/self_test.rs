use auth::{session_store::SessionRecord, token::TokenKind, AuthBroker};
use nix::unistd::User;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SelfTestError {
    #[error("no OS account for {0}")]
    UnknownUser(String),
    #[error("unable to look up {username}: {source}")]
    Lookup {
        username: String,
        source: nix::Error,
    },
    #[error("issued token did not verify: {0}")]
    Verify(auth::AuthError),
    #[error("token was verified as {got}, expected {expected}")]
    WrongUser { got: String, expected: String },
    #[error("session store returned a different record")]
    StoreMismatch,
    #[error("session store check failed: {0}")]
    Store(#[from] auth::session_store::StoreError),
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
}

/// `main <config> --test <username>`: checks the OS account, a token round
/// trip through the configured verifiers and the session store.
#[tracing::instrument(skip(broker), err)]
pub async fn run(broker: &AuthBroker, username: &str) -> Result<(), SelfTestError> {
    let user = User::from_name(username)
        .map_err(|source| SelfTestError::Lookup {
            username: username.to_string(),
            source,
        })?
        .ok_or_else(|| SelfTestError::UnknownUser(username.to_string()))?;
    tracing::info!("Found OS user {username} with uid {}", user.uid);

    match broker.primary().codec() {
        Some(codec) => {
            let token = codec.issue(username, TokenKind::Access, Duration::from_secs(60))?;
            let guarded = broker
                .auth_guard(Some(&token))
                .await
                .map_err(SelfTestError::Verify)?;
            tracing::info!(
                "Token from {} verified, acting as local user {}",
                codec.issuer(),
                guarded.username
            );
            if guarded.subject != username {
                return Err(SelfTestError::WrongUser {
                    got: guarded.subject,
                    expected: username.to_string(),
                });
            }
        }
        None => tracing::info!("No token issuer configured, skipping token check"),
    }

    let store = broker.store();
    store.ping().await?;
    let session_id = format!("self-test-{}", uuid::Uuid::new_v4());
    let now = chrono::Utc::now().timestamp();
    let record = SessionRecord::new(None, now + 60, now + 60);
    store.put_session(username, &session_id, &record).await?;
    let stored = store.get_session(username, &session_id).await?;
    store.delete_session(username, &session_id).await?;
    if stored.as_ref() != Some(&record) {
        return Err(SelfTestError::StoreMismatch);
    }
    tracing::info!("Session store round trip succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::{
        broker::PrimaryProvider, config::SiteConfig, session_store::MemorySessionStore,
        token::TokenCodec, verifier::VerifierRegistry,
    };
    use std::sync::Arc;

    fn broker() -> AuthBroker {
        let codec = TokenCodec::new(
            "broker-self-test",
            jsonwebtoken::Algorithm::RS256,
            include_bytes!("../crates/auth/test_data/local_private.pem"),
            include_bytes!("../crates/auth/test_data/local_public.pem"),
        )
        .unwrap();
        let mut registry = VerifierRegistry::default();
        registry.register("broker-self-test", Arc::new(codec));
        AuthBroker::new(
            registry,
            PrimaryProvider::None,
            SiteConfig::default(),
            Arc::new(MemorySessionStore::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn current_user_passes() {
        let me = User::from_uid(nix::unistd::getuid()).unwrap().unwrap();
        run(&broker(), &me.name).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_user_fails() {
        let err = run(&broker(), "no-such-user-7f3a").await.unwrap_err();
        assert!(matches!(err, SelfTestError::UnknownUser(_)));
    }
}
