use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::session_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Not authorized")]
    NotAuthorized,
    #[error("Malformed login request")]
    MalformedLogin,
    #[error("Invalid username/password combo")]
    InvalidCredentials,
    #[error("User does not exist")]
    UnknownOsUser,
    #[error("Missing refresh token")]
    MissingRefreshToken,
    #[error("Invalid refresh token")]
    InvalidRefreshToken,
    #[error("Scripting access not enabled for this server")]
    ScriptingDisabled,
    #[error("Token does not permit scripting")]
    ScriptingNotPermitted,
    #[error("Login not implemented")]
    NotImplemented,
    #[error("Token refresh not implemented")]
    RefreshNotImplemented,
    #[error("Timed out waiting for session refresh, please try again")]
    LockTimeout,
    #[error("Missing OIDC verifier")]
    MissingOidcVerifier,
    #[error("Invalid OIDC state")]
    StateMismatch,
    #[error("Authentication error")]
    UpstreamRejected,
    #[error("Received an ID token not directed to us")]
    WrongAudience,
    #[error("Unable to determine user ID from upstream token")]
    MissingUniqueField,
    #[error("Identity Provider did not supply group membership")]
    MissingGroups,
    #[error("Not part of required group")]
    NotInGroup,
    #[error("Invalid group membership info received")]
    InvalidGroups,
    #[error("Error requesting tokens from identity provider")]
    Upstream(String),
    #[error("directory service error: {0}")]
    Directory(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("key error: {0}")]
    Key(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAuthorized
            | Self::InvalidCredentials
            | Self::UnknownOsUser
            | Self::ScriptingNotPermitted
            | Self::UpstreamRejected
            | Self::WrongAudience
            | Self::MissingGroups
            | Self::NotInGroup
            | Self::InvalidGroups => StatusCode::FORBIDDEN,
            Self::MalformedLogin
            | Self::MissingRefreshToken
            | Self::InvalidRefreshToken
            | Self::MissingOidcVerifier
            | Self::StateMismatch => StatusCode::BAD_REQUEST,
            Self::NotImplemented | Self::RefreshNotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::ScriptingDisabled
            | Self::LockTimeout
            | Self::MissingUniqueField
            | Self::Upstream(_)
            | Self::Directory(_)
            | Self::Config(_)
            | Self::Key(_)
            | Self::Store(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message sent over the wire. Faults carrying internal detail are
    /// replaced by a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream(_) => "Error requesting tokens from identity provider".to_string(),
            Self::Directory(_) => "Problem contacting the directory service".to_string(),
            Self::Store(_) => "Problem accessing the session store".to_string(),
            Self::Config(_) | Self::Key(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{self:?}");
        } else {
            tracing::debug!("{self}");
        }
        let body = json!({ "statusCode": status.as_u16(), "message": self.public_message() });
        (status, Json(body)).into_response()
    }
}
