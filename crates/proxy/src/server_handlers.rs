use auth::{handlers::AuthenticatedUser, AuthBroker};
use axum::{
    body::Bytes,
    extract::{FromRef, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use runner::{StartOutcome, Supervisor, SupervisorError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Routes mounted under `{api}/server`. Every route acts for the bearer's
/// local user.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<AuthBroker>: FromRef<S>,
    Supervisor: FromRef<S>,
{
    Router::new()
        .route("/start", post(start::<S>))
        .route("/stop", post(stop::<S>))
        .route("/status", get(status::<S>))
        .route("/log", get(log::<S>))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    force_restart: bool,
}

#[tracing::instrument(skip_all)]
pub async fn start<S>(
    State(supervisor): State<Supervisor>,
    AuthenticatedUser(user): AuthenticatedUser,
    body: Bytes,
) -> Response
where
    Supervisor: FromRef<S>,
{
    let request = serde_json::from_slice::<StartRequest>(&body).unwrap_or_default();
    match supervisor.start(&user.username, request.force_restart).await {
        Ok(StartOutcome::Started(_)) => Json(json!({ "success": true })).into_response(),
        Ok(StartOutcome::Existing(_)) => {
            Json(json!({ "success": true, "existing": true })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[tracing::instrument(skip_all)]
pub async fn stop<S>(
    State(supervisor): State<Supervisor>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Response
where
    Supervisor: FromRef<S>,
{
    match supervisor.stop_worker(&user.username).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn status<S>(
    State(supervisor): State<Supervisor>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> impl IntoResponse
where
    Supervisor: FromRef<S>,
{
    Json(json!({ "success": true, "running": supervisor.status(&user.username) }))
}

pub async fn log<S>(
    State(supervisor): State<Supervisor>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Response
where
    Supervisor: FromRef<S>,
{
    match supervisor.log(&user.username) {
        Some(lines) => Json(json!({ "success": true, "log": lines.join("\n") })).into_response(),
        None => SupervisorError::NoLog {
            username: user.username,
        }
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        tests::{issue, test_state},
        AppState,
    };
    use auth::token::TokenKind;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        router().with_state(state)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", issue("alice", TokenKind::Access)),
            )
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn start_status_stop() {
        let state = test_state("echo ready; exec sleep 5");

        let response = app(state.clone())
            .oneshot(request("GET", "/status", ""))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "running": false })
        );

        let response = app(state.clone())
            .oneshot(request("POST", "/start", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));
        let pid = state.supervisor.worker("alice").unwrap().pid;

        let response = app(state.clone())
            .oneshot(request("POST", "/start", ""))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "existing": true })
        );

        let response = app(state.clone())
            .oneshot(request("POST", "/start", r#"{"forceRestart": true}"#))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "success": true }));
        assert_ne!(state.supervisor.worker("alice").unwrap().pid, pid);

        let response = app(state.clone())
            .oneshot(request("GET", "/status", ""))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["running"], true);

        let response = app(state.clone())
            .oneshot(request("GET", "/log", ""))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["success"], true);

        let response = app(state.clone())
            .oneshot(request("POST", "/stop", ""))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "success": true }));

        let response = app(state)
            .oneshot(request("POST", "/stop", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["message"],
            "No existing process belonging to user alice"
        );
    }

    #[tokio::test]
    async fn failed_start_has_remediation_message() {
        let response = app(test_state("exit 1"))
            .oneshot(request("POST", "/start", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "statusCode": 500, "message": "Problem starting process for user alice" })
        );
    }

    #[tokio::test]
    async fn requires_bearer() {
        let response = app(test_state("exec sleep 5"))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(test_state("exec sleep 5"))
            .oneshot(request("GET", "/log", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
