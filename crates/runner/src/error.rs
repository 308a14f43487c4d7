use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No available ports for the backend process")]
    NoPorts,
    #[error("Problem starting process for user {username}")]
    StartFailed { username: String },
    #[error("No existing process belonging to user {username}")]
    NotRunning { username: String },
    #[error("No log available for user {username}")]
    NoLog { username: String },
    #[error("Problem killing existing process, check the kill command and sudoers configuration")]
    KillFailed { detail: String },
    #[error("invalid process configuration: {0}")]
    Config(String),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotRunning { .. } => StatusCode::BAD_REQUEST,
            Self::NoLog { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::KillFailed { detail } => tracing::error!("{self}: {detail}"),
            _ if status.is_server_error() => tracing::error!("{self:?}"),
            _ => tracing::debug!("{self}"),
        }
        let body = json!({ "statusCode": status.as_u16(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}
