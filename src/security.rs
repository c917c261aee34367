use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const KEY_HEADER: &str = "X-Catmatch-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AuthContext>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("MATCHER_API_KEYS").unwrap_or_default();
        Self::from_list(&raw)
    }

    /// Parses a comma-separated `org:key` list. Malformed entries are skipped.
    pub fn from_list(raw: &str) -> Self {
        let mut records = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.split_once(':') {
                Some((org, secret)) if !org.trim().is_empty() && !secret.trim().is_empty() => {
                    records.insert(
                        secret.trim().to_string(),
                        AuthContext {
                            org_id: org.trim().to_string(),
                            api_key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "catmatch.api",
                    "ignored malformed MATCHER_API_KEYS entry at position {}",
                    idx + 1
                ),
            }
        }

        if records.is_empty() {
            warn!(
                target = "catmatch.api",
                "MATCHER_API_KEYS produced no keys; every protected route will answer 401"
            );
        } else {
            info!(
                target = "catmatch.api",
                key_count = records.len(),
                "loaded API keys from env"
            );
        }
        Self {
            records: Arc::new(records),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Catmatch-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn key_list_skips_malformed_entries() {
        let state = AuthState::from_list("shop:abc, broken, :nokey, other:def");
        assert_eq!(state.authenticate("abc").unwrap().org_id, "shop");
        assert_eq!(state.authenticate("def").unwrap().api_key_id, "key-04");
        assert!(state.authenticate("broken").is_none());
    }

    #[test]
    fn bearer_and_header_keys_are_read() {
        let mut headers = http::HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static(" abc "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc"));

        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("xyz"));
    }
}
