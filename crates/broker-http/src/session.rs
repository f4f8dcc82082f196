use axum::http::{header, HeaderMap, HeaderValue};
use uuid::Uuid;

/// Issues an opaque session id on first contact, purely so the browser
/// can later associate OAuth tokens. The broker does nothing else with
/// it.
///
/// Returns a `Set-Cookie` header value when the request didn't already
/// carry one.
pub fn ensure_session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<HeaderValue> {
    if has_cookie(headers, cookie_name) {
        return None;
    }
    let value = format!("{cookie_name}={}; Path=/; HttpOnly; SameSite=Lax", Uuid::new_v4());
    HeaderValue::from_str(&value).ok()
}

fn has_cookie(headers: &HeaderMap, cookie_name: &str) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|raw| {
            raw.split(';')
                .map(str::trim)
                .any(|pair| pair.split('=').next() == Some(cookie_name))
        })
}
