use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::{
    config::{AuthConfig, SiteConfig},
    cookies::clear_cookie,
    external::ExternalVerifier,
    google::{GoogleVerifier, GOOGLE_ISSUERS, GOOGLE_JWKS_URI},
    keys::RemoteJwks,
    ldap::LdapAuthenticator,
    local::PasswordProvider,
    oidc::{CallbackQuery, HttpUpstream, OidcProvider, RefreshOutcome},
    reply::AuthReply,
    session_store::{MemorySessionStore, SessionStore},
    token::{TokenCodec, TokenKind},
    user_db::UserDatabase,
    user_map::UserMap,
    verifier::VerifierRegistry,
    AuthError, REFRESH_COOKIE,
};

/// Who a request is acting for, once its token has been verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardedUser {
    /// Local OS username, after the issuer's user table.
    pub username: String,
    /// Username as asserted by the token.
    pub subject: String,
    pub scripting: bool,
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// The provider that handles login and refresh. Google and external tokens
/// are minted elsewhere, so they only ever appear as verifiers.
pub enum PrimaryProvider {
    Password(PasswordProvider),
    Oidc(OidcProvider),
    None,
}

impl PrimaryProvider {
    pub fn codec(&self) -> Option<&Arc<TokenCodec>> {
        match self {
            Self::Password(provider) => Some(provider.codec()),
            Self::Oidc(provider) => Some(provider.codec()),
            Self::None => None,
        }
    }
}

pub struct AuthBroker {
    registry: VerifierRegistry,
    primary: PrimaryProvider,
    site: SiteConfig,
    store: Arc<dyn SessionStore>,
    watchers: Vec<JoinHandle<()>>,
}

impl Drop for AuthBroker {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

fn load_user_map(
    registry: &mut VerifierRegistry,
    watchers: &mut Vec<JoinHandle<()>>,
    issuers: &[&str],
    path: Option<&std::path::Path>,
) -> Result<(), AuthError> {
    let Some(path) = path else {
        return Ok(());
    };
    let map = UserMap::load(path)?;
    tracing::info!("Loaded user table {} ({} entries)", path.display(), map.len());
    watchers.extend(map.watch());
    for issuer in issuers {
        registry.register_user_map(*issuer, map.clone());
    }
    Ok(())
}

impl AuthBroker {
    pub fn new(
        registry: VerifierRegistry,
        primary: PrimaryProvider,
        site: SiteConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, AuthError> {
        if registry.is_empty() {
            return Err(AuthError::Config("No valid token verifiers specified".to_string()));
        }
        Ok(Self {
            registry,
            primary,
            site,
            store,
            watchers: Vec::new(),
        })
    }

    /// Builds every configured provider. Must run inside a tokio runtime;
    /// user table watchers are spawned onto it.
    #[tracing::instrument(skip_all, err)]
    pub async fn from_config(config: &AuthConfig, site: &SiteConfig) -> Result<Self, AuthError> {
        config.validate()?;
        let mut registry = VerifierRegistry::default();
        let mut watchers = Vec::new();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| AuthError::Config(format!("unable to build HTTP client: {err}")))?;

        let store: Arc<dyn SessionStore> = match &config.session_store.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str()).map_err(|err| {
                    AuthError::Config(format!("invalid redis url {url}: {err}"))
                })?;
                tracing::info!("Using redis session store at {url}");
                Arc::new(client)
            }
            None => Arc::new(MemorySessionStore::default()),
        };

        let mut primary = PrimaryProvider::None;
        if let Some(local) = &config.local {
            let codec = Arc::new(TokenCodec::from_config(&local.signing)?);
            let pool = SqlitePool::build(&local.database_path).await.map_err(|err| {
                tracing::error!("{err:?}");
                AuthError::Config(format!(
                    "unable to open user database {}: {err}",
                    local.database_path.display()
                ))
            })?;
            registry.register(codec.issuer(), codec.clone());
            load_user_map(
                &mut registry,
                &mut watchers,
                &[codec.issuer()],
                local.user_lookup_table.as_deref(),
            )?;
            primary = PrimaryProvider::Password(PasswordProvider::new(
                codec,
                Arc::new(pool),
                local.signing.ages(),
                site.clone(),
                local.embed_refresh,
                config.check_os_user,
            ));
        }
        if let Some(ldap) = &config.ldap {
            let codec = Arc::new(TokenCodec::from_config(&ldap.signing)?);
            registry.register(codec.issuer(), codec.clone());
            load_user_map(
                &mut registry,
                &mut watchers,
                &[codec.issuer()],
                ldap.user_lookup_table.as_deref(),
            )?;
            primary = PrimaryProvider::Password(PasswordProvider::new(
                codec,
                Arc::new(LdapAuthenticator::new(ldap.clone())),
                ldap.signing.ages(),
                site.clone(),
                ldap.embed_refresh,
                config.check_os_user,
            ));
        }
        if let Some(pam) = &config.pam {
            #[cfg(feature = "pam")]
            {
                let codec = Arc::new(TokenCodec::from_config(&pam.signing)?);
                registry.register(codec.issuer(), codec.clone());
                load_user_map(
                    &mut registry,
                    &mut watchers,
                    &[codec.issuer()],
                    pam.user_lookup_table.as_deref(),
                )?;
                primary = PrimaryProvider::Password(PasswordProvider::new(
                    codec,
                    Arc::new(crate::pam::PamAuthenticator::new(pam.service.clone())),
                    pam.signing.ages(),
                    site.clone(),
                    pam.embed_refresh,
                    config.check_os_user,
                ));
            }
            #[cfg(not(feature = "pam"))]
            {
                let _ = pam;
                return Err(AuthError::Config(
                    "PAM authentication requires building with the `pam` feature".to_string(),
                ));
            }
        }
        if let Some(oidc) = &config.oidc {
            let codec = Arc::new(TokenCodec::from_config(&oidc.signing)?);
            let upstream = HttpUpstream::discover(http.clone(), oidc).await?;
            registry.register(codec.issuer(), codec.clone());
            load_user_map(
                &mut registry,
                &mut watchers,
                &[codec.issuer()],
                oidc.user_lookup_table.as_deref(),
            )?;
            primary = PrimaryProvider::Oidc(OidcProvider::new(
                oidc.clone(),
                site.clone(),
                codec,
                Arc::new(upstream),
                store.clone(),
            ));
        }
        if let Some(google) = &config.google {
            let keys = Arc::new(RemoteJwks::new(http.clone(), GOOGLE_JWKS_URI));
            let verifier = Arc::new(GoogleVerifier::new(google.clone(), keys));
            for issuer in GOOGLE_ISSUERS {
                registry.register(issuer, verifier.clone());
            }
            load_user_map(
                &mut registry,
                &mut watchers,
                &GOOGLE_ISSUERS,
                google.user_lookup_table.as_deref(),
            )?;
        }
        if let Some(external) = &config.external {
            let verifier = Arc::new(ExternalVerifier::from_config(external)?);
            for issuer in verifier.issuers() {
                registry.register(issuer.clone(), verifier.clone());
            }
            let issuers: Vec<&str> = external.issuers.iter().map(String::as_str).collect();
            load_user_map(
                &mut registry,
                &mut watchers,
                &issuers,
                external.user_lookup_table.as_deref(),
            )?;
        }

        let mut broker = Self::new(registry, primary, site.clone(), store)?;
        broker.watchers = watchers;
        Ok(broker)
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn primary(&self) -> &PrimaryProvider {
        &self.primary
    }

    /// Resolves a bearer token to the local user it acts for. Refresh tokens
    /// are not access tokens and are turned away here.
    pub async fn auth_guard(&self, token: Option<&str>) -> Result<GuardedUser, AuthError> {
        let token = token.ok_or(AuthError::NotAuthorized)?;
        let claims = self
            .registry
            .verify(token)
            .await
            .ok_or(AuthError::NotAuthorized)?;
        if claims.kind() == TokenKind::Refresh || claims.username.is_empty() {
            return Err(AuthError::NotAuthorized);
        }
        let username = self
            .registry
            .local_username(&claims)
            .ok_or(AuthError::NotAuthorized)?;
        Ok(GuardedUser {
            username,
            scripting: claims.scripting,
            subject: claims.username,
        })
    }

    /// Password providers need credentials; OIDC starts the redirect dance.
    pub async fn login(&self, credentials: Option<Credentials>) -> Result<AuthReply, AuthError> {
        match &self.primary {
            PrimaryProvider::Password(provider) => {
                let credentials = credentials.ok_or(AuthError::MalformedLogin)?;
                let grant = provider
                    .login(&credentials.username, &credentials.password)
                    .await?;
                Ok(grant.into())
            }
            PrimaryProvider::Oidc(provider) => provider.login_start(),
            PrimaryProvider::None => Err(AuthError::NotImplemented),
        }
    }

    pub async fn oidc_callback(
        &self,
        query: &CallbackQuery,
        verifier_cookie: Option<&str>,
        session_cookie: Option<&str>,
    ) -> Result<AuthReply, AuthError> {
        match &self.primary {
            PrimaryProvider::Oidc(provider) => {
                provider
                    .callback(query, verifier_cookie, session_cookie)
                    .await
            }
            _ => Err(AuthError::NotImplemented),
        }
    }

    pub async fn refresh(
        &self,
        refresh_token: Option<&str>,
        scripting: bool,
    ) -> Result<AuthReply, AuthError> {
        if scripting && !self.site.scripting_enabled {
            return Err(AuthError::ScriptingDisabled);
        }
        match &self.primary {
            PrimaryProvider::Password(provider) => {
                Ok(provider.refresh(refresh_token, scripting)?.into())
            }
            PrimaryProvider::Oidc(provider) => {
                match provider.refresh(refresh_token, scripting).await? {
                    RefreshOutcome::Issued(grant) => Ok(grant.into()),
                    RefreshOutcome::NoRefreshAvailable => {
                        Ok(AuthReply::redirect(self.site.login_url()))
                    }
                }
            }
            PrimaryProvider::None => Err(AuthError::RefreshNotImplemented),
        }
    }

    /// Always succeeds, including for sessions that are already gone.
    pub async fn logout(&self, refresh_token: Option<&str>, logout_token: Option<&str>) -> AuthReply {
        match &self.primary {
            PrimaryProvider::Password(provider) => provider.logout(),
            PrimaryProvider::Oidc(provider) => provider.logout(refresh_token, logout_token).await,
            PrimaryProvider::None => AuthReply::json(json!({ "success": true }))
                .with_cookie(clear_cookie(REFRESH_COOKIE, &self.site)),
        }
    }

    pub fn status(&self, user: &GuardedUser) -> Value {
        json!({ "success": true, "username": user.username })
    }

    /// Mints a long lived scripting token for an authenticated user.
    pub fn scripting_token(&self, user: &GuardedUser) -> Result<AuthReply, AuthError> {
        if !self.site.scripting_enabled {
            return Err(AuthError::ScriptingDisabled);
        }
        let grant = match &self.primary {
            PrimaryProvider::Password(provider) => provider.scripting_grant(&user.subject)?,
            PrimaryProvider::Oidc(provider) => provider.scripting_grant(&user.subject)?,
            PrimaryProvider::None => return Err(AuthError::NotImplemented),
        };
        Ok(grant.into())
    }
}
