use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRef, FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    broker::{AuthBroker, Credentials, GuardedUser},
    cookies::{clear_cookie, cookie_value},
    oidc::{failure_reply, CallbackQuery},
    AuthError, LOGOUT_COOKIE, OIDC_SESSION_COOKIE, OIDC_VERIFIER_COOKIE, REFRESH_COOKIE,
};

/// Routes mounted under `{api}/auth`.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<AuthBroker>: FromRef<S>,
{
    Router::new()
        .route("/login", get(login_start::<S>).post(login::<S>))
        .route("/oidcCallback", get(oidc_callback::<S>))
        .route("/refresh", post(refresh::<S>))
        .route("/logout", get(logout::<S>).post(logout::<S>))
        .route("/status", get(status::<S>))
        .route("/scripting", post(scripting_token::<S>))
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

/// `Authorization: Bearer <token>`. Tokens in the query string are only
/// accepted for WebSocket upgrades, by the proxy.
pub fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// The verified user behind a request. Rejects with 403 when the bearer
/// token is missing or does not verify.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub GuardedUser);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    Arc<AuthBroker>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let broker = Arc::<AuthBroker>::from_ref(state);
        let token = bearer_token(parts);
        broker
            .auth_guard(token.as_deref())
            .await
            .map(AuthenticatedUser)
    }
}

#[tracing::instrument(skip_all)]
pub async fn login_start<S>(State(broker): State<Arc<AuthBroker>>, headers: HeaderMap) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    match broker.login(None).await {
        Ok(reply) => reply.into_response(),
        Err(err) => failure_reply(broker.site(), &err, wants_json(&headers)).into_response(),
    }
}

#[tracing::instrument(skip_all)]
pub async fn login<S>(State(broker): State<Arc<AuthBroker>>, body: Bytes) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    let credentials = match serde_json::from_slice::<Credentials>(&body) {
        Ok(credentials) => credentials,
        Err(err) => {
            tracing::debug!("Unreadable login body: {err}");
            return AuthError::MalformedLogin.into_response();
        }
    };
    match broker.login(Some(credentials)).await {
        Ok(reply) => reply.into_response(),
        Err(err) => err.into_response(),
    }
}

#[tracing::instrument(skip_all)]
pub async fn oidc_callback<S>(
    State(broker): State<Arc<AuthBroker>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    let verifier = cookie_value(&headers, OIDC_VERIFIER_COOKIE);
    let session = cookie_value(&headers, OIDC_SESSION_COOKIE);
    match broker
        .oidc_callback(&query, verifier.as_deref(), session.as_deref())
        .await
    {
        Ok(reply) => reply.into_response(),
        Err(err) => {
            let site = broker.site();
            failure_reply(site, &err, wants_json(&headers))
                .with_cookie(clear_cookie(OIDC_VERIFIER_COOKIE, site))
                .with_cookie(clear_cookie(OIDC_SESSION_COOKIE, site))
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    scripting: bool,
}

#[tracing::instrument(skip_all)]
pub async fn refresh<S>(
    State(broker): State<Arc<AuthBroker>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    // An empty or non JSON body is a plain refresh.
    let request = serde_json::from_slice::<RefreshRequest>(&body).unwrap_or_default();
    let refresh_token = cookie_value(&headers, REFRESH_COOKIE);
    match broker.refresh(refresh_token.as_deref(), request.scripting).await {
        Ok(reply) => reply.into_response(),
        Err(err) => err.into_response(),
    }
}

#[tracing::instrument(skip_all)]
pub async fn logout<S>(State(broker): State<Arc<AuthBroker>>, headers: HeaderMap) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    let refresh_token = cookie_value(&headers, REFRESH_COOKIE);
    let logout_token = cookie_value(&headers, LOGOUT_COOKIE);
    broker
        .logout(refresh_token.as_deref(), logout_token.as_deref())
        .await
        .into_response()
}

pub async fn status<S>(
    State(broker): State<Arc<AuthBroker>>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> impl IntoResponse
where
    Arc<AuthBroker>: FromRef<S>,
{
    Json(broker.status(&user))
}

#[tracing::instrument(skip_all)]
pub async fn scripting_token<S>(
    State(broker): State<Arc<AuthBroker>>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Response
where
    Arc<AuthBroker>: FromRef<S>,
{
    match broker.scripting_token(&user) {
        Ok(reply) => reply.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::tests::{issue, password_broker},
        config::SiteConfig,
        token::TokenKind,
    };
    use axum::{body::Body, http::Request, http::StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(site: SiteConfig) -> Router {
        router().with_state(Arc::new(password_broker(site)))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn login_request(password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "username": "alice", "password": password }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn local_login() {
        let response = app(SiteConfig::default())
            .oneshot(login_request("correct"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("Refresh-Token="));
        assert!(cookie.contains("HttpOnly"));
        let body = body_json(response).await;
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["expires_in"], 900);
        assert!(body["access_token"].is_string());
    }

    #[tokio::test]
    async fn failed_login_is_generic() {
        let response = app(SiteConfig::default())
            .oneshot(login_request("wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            json!({ "statusCode": 403, "message": "Invalid username/password combo" })
        );

        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .body(Body::from("username=alice"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn refresh_with_cookie() {
        let refresh = issue(TokenKind::Refresh, 60);
        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .header(header::COOKIE, format!("Refresh-Token={refresh}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["username"], "alice");

        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Missing refresh token");
    }

    #[tokio::test]
    async fn status_needs_a_valid_bearer() {
        let token = issue(TokenKind::Access, 60);
        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "username": "alice" })
        );

        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .uri(format!("/status?access_token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let expired = issue(TokenKind::Access, 0);
        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header(header::AUTHORIZATION, format!("Bearer {expired}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            json!({ "statusCode": 403, "message": "Not authorized" })
        );
    }

    #[tokio::test]
    async fn scripting_token_endpoint() {
        let token = issue(TokenKind::Access, 60);
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/scripting")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app(SiteConfig::default()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["message"],
            "Scripting access not enabled for this server"
        );

        let site = SiteConfig {
            scripting_enabled: true,
            ..SiteConfig::default()
        };
        let response = app(site).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["expires_in"], 7200);
    }

    #[tokio::test]
    async fn logout_clears_refresh_cookie() {
        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn oidc_routes_without_oidc() {
        let response = app(SiteConfig::default())
            .oneshot(
                Request::builder()
                    .uri("/oidcCallback?code=x&state=y")
                    .header(header::ACCEPT, "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        // Browsers are sent back to the dashboard instead.
        let response = app(SiteConfig::default())
            .oneshot(Request::builder().uri("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .contains("/dashboard?err="));
    }
}
