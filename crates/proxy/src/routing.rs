use auth::{handlers::bearer_token, AuthBroker, AuthError};
use axum::extract::Query;
use http::{header, request::Parts, HeaderMap, StatusCode, Uri};
use runner::{Supervisor, SupervisorError, WorkerInfo};
use serde::Deserialize;
use serde_json::{json, Value};

/// Where a request entering the public listener is headed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// WebSocket upgrade, authenticated by a `token` query parameter.
    WebSocket,
    /// `{api}/scripting/*`, needs a scripting token.
    Scripting,
    /// Handled by the internal auth/server API.
    Api,
    Frontend,
}

impl Route {
    pub fn needs_worker(self) -> bool {
        matches!(self, Route::WebSocket | Route::Scripting)
    }
}

pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

pub fn classify(path: &str, is_upgrade: bool, api_path: &str) -> Route {
    if is_upgrade {
        return Route::WebSocket;
    }
    let under = |prefix: &str| {
        path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    };
    if under(&format!("{api_path}/scripting")) {
        Route::Scripting
    } else if under(api_path) || path == "/config" {
        Route::Api
    } else {
        Route::Frontend
    }
}

pub fn query_token(uri: &Uri) -> Option<String> {
    #[derive(Deserialize)]
    struct TokenQuery {
        token: Option<String>,
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl RouteError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(err) => err.status_code(),
            Self::Supervisor(err) => err.status_code(),
        }
    }

    /// Same shape as the API's error bodies.
    pub fn body(&self) -> Value {
        let message = match self {
            Self::Auth(err) => err.public_message(),
            Self::Supervisor(err) => err.to_string(),
        };
        json!({ "statusCode": self.status_code().as_u16(), "message": message })
    }
}

/// Authenticates a worker-bound request and makes sure the user's worker is
/// running. Scripting calls without the scripting flag are refused before
/// any worker is touched.
#[tracing::instrument(skip_all, err)]
pub async fn resolve_worker(
    broker: &AuthBroker,
    supervisor: &Supervisor,
    route: Route,
    parts: &Parts,
) -> Result<WorkerInfo, RouteError> {
    let token = match route {
        Route::WebSocket => query_token(&parts.uri),
        _ => bearer_token(parts),
    };
    let user = broker.auth_guard(token.as_deref()).await?;
    if route == Route::Scripting && !user.scripting {
        return Err(AuthError::ScriptingNotPermitted.into());
    }
    let worker = supervisor.ensure_worker(&user.username).await?;
    tracing::debug!(
        "Redirecting to backend process for {} (port {})",
        worker.username,
        worker.port
    );
    Ok(worker)
}
