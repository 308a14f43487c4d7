use cookie::{time::Duration, Cookie, SameSite};
use http::{header::COOKIE, HeaderMap};

use crate::config::SiteConfig;

/// Flow cookies survive the top-level redirect back from the IdP, so they
/// cannot be `SameSite=Strict`.
const FLOW_COOKIE_AGE: Duration = Duration::seconds(600);

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

/// HTTP only, `SameSite=Strict` and scoped to the auth path.
pub fn auth_cookie(name: &str, value: String, max_age_secs: u64, site: &SiteConfig) -> Cookie<'static> {
    Cookie::build((name.to_string(), value))
        .http_only(true)
        .secure(site.secure_cookies)
        .same_site(SameSite::Strict)
        .path(site.auth_path())
        .max_age(Duration::seconds(max_age_secs as i64))
        .build()
}

pub fn flow_cookie(name: &str, value: String, site: &SiteConfig) -> Cookie<'static> {
    Cookie::build((name.to_string(), value))
        .http_only(true)
        .secure(site.secure_cookies)
        .same_site(SameSite::Lax)
        .path(site.auth_path())
        .max_age(FLOW_COOKIE_AGE)
        .build()
}

/// Expires a cookie previously set with `auth_cookie` or `flow_cookie`.
pub fn clear_cookie(name: &str, site: &SiteConfig) -> Cookie<'static> {
    Cookie::build((name.to_string(), ""))
        .http_only(true)
        .secure(site.secure_cookies)
        .same_site(SameSite::Strict)
        .path(site.auth_path())
        .max_age(Duration::ZERO)
        .build()
}
