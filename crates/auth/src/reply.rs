use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cookie::Cookie;
use serde_json::{json, Value};

/// Freshly minted bearer token plus whatever refresh material goes with it.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
    pub username: Option<String>,
    /// Only for providers configured to embed the refresh token in the body.
    pub refresh_token: Option<String>,
    pub cookies: Vec<Cookie<'static>>,
}

impl TokenGrant {
    pub fn body(&self) -> Value {
        let mut body = json!({
            "access_token": self.access_token,
            "token_type": "bearer",
            "expires_in": self.expires_in,
        });
        if let Some(username) = &self.username {
            body["username"] = username.clone().into();
        }
        if let Some(refresh_token) = &self.refresh_token {
            body["refresh_token"] = refresh_token.clone().into();
        }
        body
    }
}

/// What an auth endpoint answers with: a JSON body or a redirect, plus
/// cookies to set.
#[derive(Debug, Clone)]
pub struct AuthReply {
    status: StatusCode,
    body: Option<Value>,
    location: Option<String>,
    cookies: Vec<Cookie<'static>>,
}

impl AuthReply {
    pub fn json(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: Some(body),
            location: None,
            cookies: Vec::new(),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(json!({ "statusCode": status.as_u16(), "message": message.into() })),
            location: None,
            cookies: Vec::new(),
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FOUND,
            body: None,
            location: Some(location.into()),
            cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie<'static>) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn with_cookies(mut self, cookies: impl IntoIterator<Item = Cookie<'static>>) -> Self {
        self.cookies.extend(cookies);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie<'static>> {
        self.cookies.iter().rev().find(|cookie| cookie.name() == name)
    }
}

impl From<TokenGrant> for AuthReply {
    fn from(grant: TokenGrant) -> Self {
        AuthReply::json(grant.body()).with_cookies(grant.cookies)
    }
}

impl IntoResponse for AuthReply {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            Some(body) => (self.status, Json(body)).into_response(),
            None => self.status.into_response(),
        };
        let headers = response.headers_mut();
        if let Some(location) = self.location {
            match HeaderValue::from_str(&location) {
                Ok(location) => {
                    headers.insert(header::LOCATION, location);
                }
                Err(err) => tracing::error!("unusable redirect location: {err:?}"),
            }
        }
        for cookie in self.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                headers.append(header::SET_COOKIE, value);
            }
        }
        response
    }
}
