use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{config::LdapAuthConfig, password::PasswordAuthenticator, AuthError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(500);

const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_CONFIDENTIALITY_REQUIRED: u32 = 13;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;

/// Connection level failures that a fresh connection may fix.
fn is_transient(err: &LdapError) -> bool {
    match err {
        LdapError::Io { .. }
        | LdapError::EndOfStream
        | LdapError::Timeout { .. }
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. } => true,
        LdapError::LdapResult { result } => matches!(
            result.rc,
            RC_CONFIDENTIALITY_REQUIRED | RC_BUSY | RC_UNAVAILABLE
        ),
        _ => false,
    }
}

/// Search-then-bind authentication against a directory. The search
/// connection is kept between logins and rebuilt after transient failures.
pub struct LdapAuthenticator {
    config: LdapAuthConfig,
    search_conn: Mutex<Option<Ldap>>,
}

impl LdapAuthenticator {
    pub fn new(config: LdapAuthConfig) -> Self {
        Self {
            config,
            search_conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Ldap, LdapError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(CONNECT_TIMEOUT)
            .set_starttls(self.config.starttls);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.url).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                tracing::warn!("LDAP connection closed: {err}");
            }
        });
        Ok(ldap)
    }

    async fn search_connection(&self) -> Result<Ldap, LdapError> {
        let mut cached = self.search_conn.lock().await;
        if let Some(ldap) = cached.as_ref() {
            return Ok(ldap.clone());
        }
        let mut ldap = self.connect().await?;
        if let (Some(dn), Some(password)) = (&self.config.admin_dn, &self.config.admin_password) {
            ldap.simple_bind(dn, password).await?.success()?;
        }
        *cached = Some(ldap.clone());
        Ok(ldap)
    }

    async fn reset(&self) {
        if let Some(mut ldap) = self.search_conn.lock().await.take() {
            if let Err(err) = ldap.unbind().await {
                tracing::debug!("Dropping stale LDAP connection: {err}");
            }
        }
    }

    async fn find_dn(&self, username: &str) -> Result<Option<String>, LdapError> {
        let mut ldap = self.search_connection().await?;
        let filter = self
            .config
            .search_filter
            .replace("{username}", &ldap_escape(username));
        let (entries, _) = ldap
            .search(&self.config.search_base, Scope::Subtree, &filter, vec!["dn"])
            .await?
            .success()?;
        Ok(entries
            .into_iter()
            .next()
            .map(|entry| SearchEntry::construct(entry).dn))
    }

    async fn attempt(&self, username: &str, password: &str) -> Result<bool, LdapError> {
        let Some(dn) = self.find_dn(username).await? else {
            tracing::debug!("No LDAP entry for {username}");
            return Ok(false);
        };
        let mut user_conn = self.connect().await?;
        let result = user_conn.simple_bind(&dn, password).await?;
        if let Err(err) = user_conn.unbind().await {
            tracing::debug!("LDAP unbind after user bind failed: {err}");
        }
        match result.rc {
            0 => Ok(true),
            RC_INVALID_CREDENTIALS => Ok(false),
            _ => Err(LdapError::LdapResult { result }),
        }
    }
}

#[async_trait]
impl PasswordAuthenticator for LdapAuthenticator {
    #[tracing::instrument(skip(self, password), err)]
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        // An empty password would turn into an anonymous bind.
        if password.is_empty() {
            return Ok(false);
        }
        match self.attempt(username, password).await {
            Err(err) if is_transient(&err) => {
                tracing::warn!("LDAP error, recreating client and retrying: {err}");
                self.reset().await;
                tokio::time::sleep(RETRY_DELAY).await;
                self.attempt(username, password).await
            }
            other => other,
        }
        .map_err(|err| {
            tracing::error!("{err:?}");
            AuthError::Directory(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3::LdapResult;

    fn result(rc: u32) -> LdapError {
        LdapError::LdapResult {
            result: LdapResult {
                rc,
                matched: String::new(),
                text: String::new(),
                refs: vec![],
                ctrls: vec![],
            },
        }
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(is_transient(&result(RC_CONFIDENTIALITY_REQUIRED)));
        assert!(is_transient(&LdapError::EndOfStream));
        assert!(is_transient(&LdapError::Io {
            source: std::io::Error::from(std::io::ErrorKind::ConnectionReset)
        }));
        assert!(!is_transient(&result(RC_INVALID_CREDENTIALS)));
        assert!(!is_transient(&LdapError::FilterParsing));
    }

    #[tokio::test]
    async fn unreachable_directory_is_a_fault() {
        let auth = LdapAuthenticator::new(LdapAuthConfig {
            signing: crate::config::SigningConfig {
                issuer: "ldap".into(),
                key_algorithm: jsonwebtoken::Algorithm::RS256,
                private_key_location: "test_data/local_private.pem".into(),
                public_key_location: "test_data/local_public.pem".into(),
                access_token_age: 900,
                refresh_token_age: 3600,
                scripting_token_age: 3600,
            },
            url: "ldap://127.0.0.1:1".into(),
            search_base: "dc=example,dc=org".into(),
            search_filter: "(uid={username})".into(),
            admin_dn: None,
            admin_password: None,
            starttls: false,
            embed_refresh: false,
            user_lookup_table: None,
        });
        assert!(matches!(
            auth.authenticate("alice", "pw").await,
            Err(AuthError::Directory(_))
        ));
        assert!(!auth.authenticate("alice", "").await.unwrap());
    }
}
