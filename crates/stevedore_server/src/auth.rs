//! Request gate: API token and Host allowlist.
//!
//! Browsers cannot set headers on `EventSource`/`WebSocket`, so the
//! token is also accepted as an `apiToken` query parameter.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use stevedore_protocol::error::NormalizedErrorCode;

use crate::error::ApiError;
use crate::AppState;

pub async fn guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.settings.allowed_hosts.is_empty() {
        let host = request
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        if !state.settings.allowed_hosts.iter().any(|allowed| allowed == &host) {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "host_not_allowed",
                format!("host {host:?} is not in the allowed list"),
                NormalizedErrorCode::AccessDenied,
            ));
        }
    }

    if let Some(expected) = &state.settings.api_token {
        let header_token = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string);
        let query_token = request.uri().query().and_then(extract_api_token);

        let presented = header_token.or(query_token);
        if presented.as_deref() != Some(expected.as_str()) {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid API token",
                NormalizedErrorCode::AccessDenied,
            ));
        }
    }

    Ok(next.run(request).await)
}

fn extract_api_token(query: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("apiToken=") {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_parses_out_of_a_query_string() {
        assert_eq!(
            extract_api_token("afterSeq=3&apiToken=sekrit&includeLogs=false"),
            Some("sekrit".to_string())
        );
        assert_eq!(extract_api_token("afterSeq=3"), None);
    }
}
