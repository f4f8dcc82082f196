use crate::error::ApiError;
use crate::state::HttpConfig;
use axum::http::HeaderMap;

/// Checked at the top of every `/internal/*` handler, mirroring how the
/// dispatcher checks a task capability token inline rather than through a
/// generic layer. Unset `internal_token` disables the check (development).
pub fn require_internal_token(headers: &HeaderMap, cfg: &HttpConfig) -> Result<(), ApiError> {
    let Some(expected) = &cfg.internal_token else {
        return Ok(());
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ApiError::unauthorized("missing or invalid bearer token")),
    }
}

/// Manual constant-time comparison. The shared secret itself has no
/// structure worth a dedicated crate for a single equality check.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
