use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Validation};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use subtle::ConstantTimeEq;

use crate::{
    config::{OidcAuthConfig, SiteConfig, TokenAges},
    cookies::{auth_cookie, clear_cookie, flow_cookie},
    crypto::SymmetricKey,
    keys::{KeySource, RemoteJwks},
    lease::{self, LeasePolicy},
    pkce::{code_challenge, generate_code_verifier, generate_session_id},
    reply::{AuthReply, TokenGrant},
    session_store::{SessionRecord, SessionStore},
    token::{TokenCodec, TokenKind},
    AuthError, LOGOUT_COOKIE, OIDC_SESSION_COOKIE, OIDC_VERIFIER_COOKIE, REFRESH_COOKIE,
};

/// Used when the IdP omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 300;
const FLOW_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub end_session_endpoint: Option<String>,
    pub jwks_uri: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_expires_in: Option<i64>,
}

impl TokenResponse {
    fn expires_in(&self) -> i64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)
    }
}

/// The identity provider as seen by the flow: its endpoints, its token
/// endpoint and its signing keys.
#[mockall::automock]
#[async_trait]
pub trait OidcUpstream: Send + Sync {
    fn authorization_endpoint(&self) -> String;
    fn end_session_endpoint(&self) -> Option<String>;
    /// Posts a grant to the token endpoint. Client credentials and scope are
    /// added here. A non-success answer is `UpstreamRejected`.
    async fn exchange(&self, params: Vec<(String, String)>) -> Result<TokenResponse, AuthError>;
    /// Signature and issuer check against the published JWKS.
    async fn verify_id_token(&self, id_token: &str) -> Result<Map<String, Value>, AuthError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    discovery: DiscoveryDocument,
    jwks: RemoteJwks,
    client_id: String,
    client_secret: String,
    scope: String,
}

impl HttpUpstream {
    #[tracing::instrument(skip_all, fields(idp = %config.idp_url), err)]
    pub async fn discover(client: reqwest::Client, config: &OidcAuthConfig) -> Result<Self, AuthError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            config.idp_url.trim_end_matches('/')
        );
        let discovery = client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AuthError::Upstream(format!("OIDC discovery failed: {err}")))?
            .json::<DiscoveryDocument>()
            .await
            .map_err(|err| AuthError::Upstream(format!("invalid discovery document: {err}")))?;
        tracing::info!(
            "Discovered OIDC endpoints, authorization at {}",
            discovery.authorization_endpoint
        );
        Ok(Self {
            jwks: RemoteJwks::new(client.clone(), discovery.jwks_uri.clone()),
            client,
            discovery,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
        })
    }
}

#[async_trait]
impl OidcUpstream for HttpUpstream {
    fn authorization_endpoint(&self) -> String {
        self.discovery.authorization_endpoint.clone()
    }

    fn end_session_endpoint(&self) -> Option<String> {
        self.discovery.end_session_endpoint.clone()
    }

    #[tracing::instrument(skip_all, err)]
    async fn exchange(&self, mut params: Vec<(String, String)>) -> Result<TokenResponse, AuthError> {
        params.push(("client_id".into(), self.client_id.clone()));
        params.push(("client_secret".into(), self.client_secret.clone()));
        params.push(("scope".into(), self.scope.clone()));
        let response = self
            .client
            .post(&self.discovery.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Token endpoint answered {status}: {body}");
            return Err(AuthError::UpstreamRejected);
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| AuthError::Upstream(format!("invalid token response: {err}")))
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<Map<String, Value>, AuthError> {
        let header = decode_header(id_token).map_err(|err| {
            tracing::warn!("Unreadable ID token: {err}");
            AuthError::UpstreamRejected
        })?;
        let key = self.jwks.key_for(header.kid.as_deref()).await?;
        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        if let Some(issuer) = &self.discovery.issuer {
            validation.set_issuer(&[issuer]);
        }
        decode::<Map<String, Value>>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::warn!("ID token rejected: {err}");
                AuthError::UpstreamRejected
            })
    }
}

/// Contents of the refresh cookie. The upstream refresh token itself never
/// leaves the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshCookie {
    pub username: String,
    pub session_id: String,
    pub session_key: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Issued(TokenGrant),
    /// The session can no longer be refreshed; the user has to log in again.
    NoRefreshAvailable,
}

pub struct OidcProvider {
    config: OidcAuthConfig,
    site: SiteConfig,
    ages: TokenAges,
    codec: Arc<TokenCodec>,
    upstream: Arc<dyn OidcUpstream>,
    store: Arc<dyn SessionStore>,
}

impl OidcProvider {
    pub fn new(
        config: OidcAuthConfig,
        site: SiteConfig,
        codec: Arc<TokenCodec>,
        upstream: Arc<dyn OidcUpstream>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            ages: config.signing.ages(),
            config,
            site,
            codec,
            upstream,
            store,
        }
    }

    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            retries: self.config.lock_retries,
            spacing: Duration::from_millis(self.config.lock_retry_interval_ms),
            ttl: Duration::from_secs(self.config.lock_ttl),
        }
    }

    /// Redirects the browser to the IdP with a fresh PKCE challenge. The
    /// verifier and the session id travel in short lived cookies.
    pub fn login_start(&self) -> Result<AuthReply, AuthError> {
        let verifier = generate_code_verifier();
        let session_id = generate_session_id();
        let sealed_verifier = self.codec.seal(&verifier, FLOW_TTL)?;

        let mut url = Url::parse(&self.upstream.authorization_endpoint())
            .map_err(|err| AuthError::Config(format!("invalid authorization endpoint: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.site.oidc_callback_url())
                .append_pair("scope", &self.config.scope)
                .append_pair("code_challenge", &code_challenge(&verifier))
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", &session_id);
            for (key, value) in &self.config.extra_auth_params {
                query.append_pair(key, value);
            }
        }

        Ok(AuthReply::redirect(url.to_string())
            .with_cookie(flow_cookie(OIDC_VERIFIER_COOKIE, sealed_verifier, &self.site))
            .with_cookie(flow_cookie(OIDC_SESSION_COOKIE, session_id, &self.site)))
    }

    /// Completes the authorization code flow and opens a broker session.
    #[tracing::instrument(skip_all, err)]
    pub async fn callback(
        &self,
        query: &CallbackQuery,
        verifier_cookie: Option<&str>,
        session_cookie: Option<&str>,
    ) -> Result<AuthReply, AuthError> {
        let session_id = match (query.state.as_deref(), session_cookie) {
            (Some(state), Some(session)) if bool::from(state.as_bytes().ct_eq(session.as_bytes())) => {
                session.to_string()
            }
            _ => {
                tracing::warn!("OIDC callback state does not match the session cookie");
                return Err(AuthError::StateMismatch);
            }
        };
        if let Some(error) = &query.error {
            tracing::warn!(
                "IdP returned an error: {error} {}",
                query.error_description.as_deref().unwrap_or_default()
            );
            return Err(AuthError::UpstreamRejected);
        }
        let code_verifier: String = verifier_cookie
            .and_then(|sealed| self.codec.unseal(sealed))
            .ok_or(AuthError::MissingOidcVerifier)?;
        let code = query.code.clone().ok_or(AuthError::UpstreamRejected)?;

        let tokens = self
            .upstream
            .exchange(vec![
                ("grant_type".into(), "authorization_code".into()),
                ("code".into(), code),
                ("code_verifier".into(), code_verifier),
                ("redirect_uri".into(), self.site.oidc_callback_url()),
            ])
            .await?;
        let id_token = tokens.id_token.as_deref().ok_or(AuthError::UpstreamRejected)?;
        let id_claims = self.upstream.verify_id_token(id_token).await?;
        let username = self.identify(&id_claims)?;
        self.check_groups(&id_claims)?;

        let now = chrono::Utc::now().timestamp();
        let session_key = SymmetricKey::generate();
        let session_ttl = tokens
            .refresh_expires_in
            .unwrap_or(self.ages.refresh.as_secs() as i64);
        let record = SessionRecord::new(
            tokens
                .refresh_token
                .as_deref()
                .map(|rt| session_key.encrypt(rt.as_bytes()))
                .transpose()?,
            now + tokens.expires_in(),
            now + session_ttl,
        );
        self.store.put_session(&username, &session_id, &record).await?;
        tracing::info!("Opened OIDC session for {username}");

        let refresh_cookie = self.refresh_cookie(&username, &session_id, &session_key, session_ttl)?;
        let mut dashboard = Url::parse(&self.site.dashboard_url())
            .map_err(|err| AuthError::Config(format!("invalid dashboard address: {err}")))?;
        dashboard.query_pairs_mut().append_pair("oidcuser", &username);

        Ok(AuthReply::redirect(dashboard.to_string())
            .with_cookie(refresh_cookie)
            .with_cookie(auth_cookie(
                LOGOUT_COOKIE,
                id_token.to_string(),
                session_ttl.max(0) as u64,
                &self.site,
            ))
            .with_cookie(clear_cookie(OIDC_VERIFIER_COOKIE, &self.site))
            .with_cookie(clear_cookie(OIDC_SESSION_COOKIE, &self.site)))
    }

    fn refresh_cookie(
        &self,
        username: &str,
        session_id: &str,
        key: &SymmetricKey,
        ttl_secs: i64,
    ) -> Result<cookie::Cookie<'static>, AuthError> {
        let ttl = ttl_secs.max(0) as u64;
        let sealed = self.codec.seal(
            &RefreshCookie {
                username: username.to_string(),
                session_id: session_id.to_string(),
                session_key: key.encode(),
            },
            Duration::from_secs(ttl),
        )?;
        Ok(auth_cookie(REFRESH_COOKIE, sealed, ttl, &self.site))
    }

    /// Checks the audience and pulls the configured unique field.
    fn identify(&self, claims: &Map<String, Value>) -> Result<String, AuthError> {
        let audience_ok = match claims.get("aud") {
            Some(Value::String(aud)) => *aud == self.config.client_id,
            Some(Value::Array(auds)) => auds
                .iter()
                .any(|aud| aud.as_str() == Some(self.config.client_id.as_str())),
            _ => false,
        };
        if !audience_ok {
            return Err(AuthError::WrongAudience);
        }
        claims
            .get(&self.config.unique_field)
            .and_then(Value::as_str)
            .filter(|username| !username.is_empty())
            .map(str::to_string)
            .ok_or(AuthError::MissingUniqueField)
    }

    fn check_groups(&self, claims: &Map<String, Value>) -> Result<(), AuthError> {
        let Some(required) = &self.config.required_group else {
            return Ok(());
        };
        match claims.get(&self.config.groups_field) {
            None => Err(AuthError::MissingGroups),
            Some(Value::Array(groups)) => {
                if groups.iter().any(|group| group.as_str() == Some(required.as_str())) {
                    tracing::debug!("Verified membership in {required}");
                    Ok(())
                } else {
                    Err(AuthError::NotInGroup)
                }
            }
            Some(_) => Err(AuthError::InvalidGroups),
        }
    }

    /// Mints a new local token for the session in the refresh cookie, going
    /// upstream only when the cached access expiry is too close. Refreshes of
    /// one session are serialized by the session lease.
    #[tracing::instrument(skip_all, err)]
    pub async fn refresh(
        &self,
        refresh_cookie: Option<&str>,
        scripting: bool,
    ) -> Result<RefreshOutcome, AuthError> {
        let sealed = refresh_cookie.ok_or(AuthError::MissingRefreshToken)?;
        let cookie: RefreshCookie = self
            .codec
            .unseal(sealed)
            .ok_or(AuthError::InvalidRefreshToken)?;
        let session_key =
            SymmetricKey::decode(&cookie.session_key).ok_or(AuthError::InvalidRefreshToken)?;

        let guard = lease::acquire(&self.store, &cookie.session_id, self.lease_policy()).await?;
        let outcome = self.refresh_locked(&cookie, &session_key, scripting).await;
        guard.release().await;
        outcome
    }

    async fn refresh_locked(
        &self,
        cookie: &RefreshCookie,
        session_key: &SymmetricKey,
        scripting: bool,
    ) -> Result<RefreshOutcome, AuthError> {
        let Some(record) = self
            .store
            .get_session(&cookie.username, &cookie.session_id)
            .await?
        else {
            tracing::info!("No session record left for {}", cookie.username);
            return Ok(RefreshOutcome::NoRefreshAvailable);
        };

        let now = chrono::Utc::now().timestamp();
        let remaining = record.access_token_expiry - now;
        if remaining > self.config.cache_access_token_min_validity as i64 {
            tracing::debug!("Reusing cached upstream validity for {}", cookie.username);
            let grant = self.mint(&cookie.username, remaining, scripting, Vec::new())?;
            return Ok(RefreshOutcome::Issued(grant));
        }

        let Some(upstream_refresh) = record
            .refresh_token
            .as_deref()
            .and_then(|encrypted| session_key.decrypt(encrypted))
            .and_then(|raw| String::from_utf8(raw).ok())
        else {
            return Ok(RefreshOutcome::NoRefreshAvailable);
        };

        // Bounded so the lease cannot lapse while the exchange is in flight.
        let exchange = self.upstream.exchange(vec![
            ("grant_type".into(), "refresh_token".into()),
            ("refresh_token".into(), upstream_refresh.clone()),
        ]);
        let exchanged = tokio::time::timeout(self.config.request_timeout(), exchange)
            .await
            .unwrap_or_else(|_| {
                Err(AuthError::Upstream(
                    "token endpoint did not answer in time".to_string(),
                ))
            });
        let tokens = match exchanged {
            Ok(tokens) => tokens,
            Err(AuthError::UpstreamRejected) => {
                tracing::info!("IdP refused the refresh token for {}", cookie.username);
                self.store
                    .delete_session(&cookie.username, &cookie.session_id)
                    .await?;
                return Ok(RefreshOutcome::NoRefreshAvailable);
            }
            Err(err) => return Err(err),
        };

        if let Some(id_token) = &tokens.id_token {
            let id_claims = self.upstream.verify_id_token(id_token).await?;
            if self.identify(&id_claims)? != cookie.username {
                tracing::warn!("Refreshed ID token names a different user than {}", cookie.username);
                return Err(AuthError::NotAuthorized);
            }
            if self.config.recheck_group_on_refresh {
                self.check_groups(&id_claims)?;
            }
        } else if self.config.recheck_group_on_refresh && self.config.required_group.is_some() {
            return Err(AuthError::MissingGroups);
        }

        let expires_at = tokens
            .refresh_expires_in
            .map_or(record.expires_at, |ttl| now + ttl);
        let refresh_token = tokens.refresh_token.as_deref().unwrap_or(&upstream_refresh);
        let updated = SessionRecord::new(
            Some(session_key.encrypt(refresh_token.as_bytes())?),
            now + tokens.expires_in(),
            expires_at,
        );
        self.store
            .put_session(&cookie.username, &cookie.session_id, &updated)
            .await?;

        let cookies = vec![self.refresh_cookie(
            &cookie.username,
            &cookie.session_id,
            session_key,
            expires_at - now,
        )?];
        let grant = self.mint(&cookie.username, tokens.expires_in(), scripting, cookies)?;
        Ok(RefreshOutcome::Issued(grant))
    }

    pub fn scripting_grant(&self, username: &str) -> Result<TokenGrant, AuthError> {
        self.mint(username, 0, true, Vec::new())
    }

    fn mint(
        &self,
        username: &str,
        ttl_secs: i64,
        scripting: bool,
        cookies: Vec<cookie::Cookie<'static>>,
    ) -> Result<TokenGrant, AuthError> {
        let (kind, ttl) = if scripting {
            (TokenKind::Scripting, self.ages.scripting.as_secs() as i64)
        } else {
            (TokenKind::Access, ttl_secs)
        };
        let access_token = self
            .codec
            .issue(username, kind, Duration::from_secs(ttl.max(0) as u64))?;
        Ok(TokenGrant {
            access_token,
            expires_in: ttl,
            username: Some(username.to_string()),
            refresh_token: None,
            cookies,
        })
    }

    /// Forgets the session locally and sends the browser to the IdP's end
    /// session endpoint when it has one. Always succeeds.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_cookie: Option<&str>, logout_token: Option<&str>) -> AuthReply {
        if let Some(cookie) = refresh_cookie.and_then(|sealed| self.codec.unseal::<RefreshCookie>(sealed)) {
            if let Err(err) = self
                .store
                .delete_session(&cookie.username, &cookie.session_id)
                .await
            {
                tracing::error!("{err:?}");
            }
        }

        let location = self
            .upstream
            .end_session_endpoint()
            .and_then(|endpoint| Url::parse(&endpoint).ok())
            .map(|mut url| {
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(hint) = logout_token {
                        query.append_pair("id_token_hint", hint);
                    }
                    query.append_pair("post_logout_redirect_uri", &self.site.server_address);
                }
                url.to_string()
            })
            .unwrap_or_else(|| self.site.server_address.clone());

        AuthReply::redirect(location)
            .with_cookie(clear_cookie(REFRESH_COOKIE, &self.site))
            .with_cookie(clear_cookie(LOGOUT_COOKIE, &self.site))
    }
}

/// JSON callers get the error body, browsers go back to the dashboard with
/// the message in `err`.
pub fn failure_reply(site: &SiteConfig, err: &AuthError, wants_json: bool) -> AuthReply {
    if wants_json {
        return AuthReply::error(err.status_code(), err.public_message());
    }
    match Url::parse(&site.dashboard_url()) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("err", &err.public_message());
            AuthReply::redirect(url.to_string())
        }
        Err(_) => AuthReply::error(err.status_code(), err.public_message()),
    }
}
