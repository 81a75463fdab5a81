use axum::{
    extract::{ConnectInfo, OriginalUri, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::GovernanceError;
use crate::governance::{Admission, Governor, RATE_LIMITED_MESSAGE};
use crate::handlers::SharedState;
use crate::identity::Identity;
use crate::models::NewUsageEntry;
use crate::response::{retry_after_secs, RateLimitResponse};

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "neuber_gate::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "neuber_gate::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// Session resolution, rate limiting and usage logging around a handler
pub async fn governance_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    // Nested routers see a stripped path
    let endpoint = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let ip = get_client_ip(&request);
    let token = session_cookie(request.headers(), &state.session_cookie);
    let identity = Identity::from_request(token.clone(), ip.clone());

    let governor = state.governor.clone();
    match governor.admit(&identity).await {
        Admission::Rejected { error } => {
            governor
                .log_denial(
                    NewUsageEntry::failure(&endpoint, elapsed_ms(started), error.to_string(), governor.now())
                        .with_ip(Some(ip)),
                )
                .await;
            error.into_response()
        }
        Admission::Throttled {
            session,
            retry_after,
            ..
        } => {
            governor
                .log_denial(
                    NewUsageEntry::failure(&endpoint, elapsed_ms(started), RATE_LIMITED_MESSAGE, governor.now())
                        .with_session(&session.session_id)
                        .with_ip(Some(ip)),
                )
                .await;

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RateLimitResponse::denied(retry_after)),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
            headers.insert(
                "X-RateLimit-Limit",
                HeaderValue::from(governor.limiter().rule().max_requests),
            );
            set_session_cookie(&mut response, &state.session_cookie, token.as_deref(), &session.session_id);
            response
        }
        Admission::Admitted { session, .. } => {
            let guard = UsageGuard::new(
                governor.clone(),
                session.session_id.clone(),
                endpoint,
                ip,
                started,
            );

            request.extensions_mut().insert(session.clone());
            let mut response = next.run(request).await;
            guard.finish(response.status()).await;

            set_session_cookie(&mut response, &state.session_cookie, token.as_deref(), &session.session_id);
            response
        }
    }
}

/// Gate for the admin routes: `Authorization: Bearer <ADMIN_TOKEN>`
pub async fn admin_auth_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = match (state.admin_token.as_deref(), bearer_token(request.headers())) {
        (Some(expected), Some(presented)) => tokens_match(expected, presented),
        _ => false,
    };

    if !authorized {
        tracing::warn!(
            uri = %request.uri(),
            client_ip = %get_client_ip(&request),
            "Rejected admin request without a valid token"
        );
        return GovernanceError::Unauthorized("Missing or invalid admin token".to_string())
            .into_response();
    }

    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Compare without returning early on the first differing byte
fn tokens_match(expected: &str, presented: &str) -> bool {
    let (expected, presented) = (expected.as_bytes(), presented.as_bytes());
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Records the outcome of an admitted request, or an aborted outcome if the
/// request future is dropped before the handler finishes.
struct UsageGuard {
    governor: Option<Arc<Governor>>,
    session_id: String,
    endpoint: String,
    ip: String,
    started: Instant,
}

impl UsageGuard {
    fn new(governor: Arc<Governor>, session_id: String, endpoint: String, ip: String, started: Instant) -> Self {
        Self {
            governor: Some(governor),
            session_id,
            endpoint,
            ip,
            started,
        }
    }

    fn entry(&self, governor: &Governor, error: Option<String>) -> NewUsageEntry {
        let entry = match error {
            None => NewUsageEntry::success(&self.endpoint, elapsed_ms(self.started), governor.now()),
            Some(error) => {
                NewUsageEntry::failure(&self.endpoint, elapsed_ms(self.started), error, governor.now())
            }
        };
        entry
            .with_session(&self.session_id)
            .with_ip(Some(self.ip.clone()))
    }

    async fn finish(mut self, status: StatusCode) {
        if let Some(governor) = self.governor.take() {
            let error = (status.is_client_error() || status.is_server_error()).then(|| {
                status
                    .canonical_reason()
                    .map(|reason| format!("{} {}", status.as_u16(), reason))
                    .unwrap_or_else(|| status.as_u16().to_string())
            });
            let entry = self.entry(&governor, error);
            governor.log_usage(entry).await;
        }
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if let Some(governor) = self.governor.take() {
            let entry = self.entry(&governor, Some("request aborted".to_string()));
            tracing::debug!(endpoint = %self.endpoint, "Request aborted after admission");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    governor.log_usage(entry).await;
                });
            }
        }
    }
}

fn set_session_cookie(response: &mut Response, cookie: &str, presented: Option<&str>, session_id: &str) {
    if presented == Some(session_id) {
        return;
    }
    let value = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", cookie, session_id);
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

/// Value of the named cookie, if the client sent one
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
        .find(|value| !value.is_empty())
}

pub fn get_client_ip(request: &Request) -> String {
    // Try to get real IP from headers first
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.trim().to_string();
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_client_ip_with_forwarded_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );

        let ip = get_client_ip(&request);
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_get_client_ip_with_real_ip_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        let ip = get_client_ip(&request);
        assert_eq!(ip, "203.0.113.1");
    }

    #[test]
    fn test_get_client_ip_from_connect_info() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4567))));

        assert_eq!(get_client_ip(&request), "10.1.2.3");
    }

    #[test]
    fn test_get_client_ip_fallback() {
        let request = Request::new(axum::body::Body::empty());
        let ip = get_client_ip(&request);
        assert_eq!(ip, "unknown");
    }

    #[test]
    fn test_session_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_id=abc-123 ; lang=en"),
        );

        assert_eq!(session_cookie(&headers, "session_id"), Some("abc-123".to_string()));
        assert_eq!(session_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret-token"));
        assert_eq!(bearer_token(&headers), Some("s3cret-token"));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("0123456789abcdef", "0123456789abcdef"));
        assert!(!tokens_match("0123456789abcdef", "0123456789abcdeX"));
        assert!(!tokens_match("0123456789abcdef", "0123"));
    }

    #[tokio::test]
    async fn test_dropped_request_is_logged_as_aborted() {
        use crate::clock::SystemClock;
        use crate::governance::GovernanceSettings;
        use crate::handlers::AppState;
        use crate::models::UsageFilter;
        use crate::rate_limit_config::RateLimitRule;
        use crate::storage::Storage;
        use axum::{middleware::from_fn_with_state, routing::get, Router};
        use std::time::Duration;
        use tower::ServiceExt;

        let governor = Arc::new(
            Governor::new(
                Storage::in_memory(),
                Arc::new(SystemClock),
                RateLimitRule::default(),
                GovernanceSettings::default(),
            )
            .unwrap(),
        );
        let state: SharedState = Arc::new(AppState::new(governor.clone(), "session_id"));
        let app = Router::new()
            .route("/slow", get(|| std::future::pending::<()>()))
            .route_layer(from_fn_with_state(state.clone(), governance_middleware))
            .with_state(state);

        let request = axum::http::Request::builder()
            .uri("/slow")
            .header("x-forwarded-for", "10.0.0.9")
            .body(axum::body::Body::empty())
            .unwrap();
        // Client goes away while the handler is still running
        let result = tokio::time::timeout(Duration::from_millis(100), app.oneshot(request)).await;
        assert!(result.is_err());

        // The aborted entry is written from a spawned task
        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = governor.recorder().query(UsageFilter::default()).collect().await.unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].endpoint, "/slow");
        assert!(!entries[0].success);
        assert_eq!(entries[0].error_message.as_deref(), Some("request aborted"));
        assert_eq!(entries[0].ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_empty_session_cookie_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session_id="));
        assert_eq!(session_cookie(&headers, "session_id"), None);
    }
}
