use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::GovernanceError;
use crate::governance::Governor;
use crate::health::HealthChecker;
use crate::models::{Session, UsageFilter};
use crate::response::{ResetResponse, SessionCountResponse, SweepResponse, UsageResponse};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub governor: Arc<Governor>,
    pub health: HealthChecker,
    pub session_cookie: String,
    /// Required bearer token for `/admin`; `None` leaves the admin routes unmounted
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(governor: Arc<Governor>, session_cookie: impl Into<String>) -> Self {
        Self {
            health: HealthChecker::new(governor.clone()),
            governor,
            session_cookie: session_cookie.into(),
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, admin_token: Option<String>) -> Self {
        self.admin_token = admin_token;
        self
    }
}

const DEFAULT_USAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize, Validate)]
pub struct UsageParams {
    #[validate(length(min = 1, max = 36))]
    pub session_id: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub endpoint: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
}

impl UsageParams {
    fn into_filter(self) -> Result<(UsageFilter, usize), GovernanceError> {
        self.validate()?;

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(GovernanceError::Validation(
                    "'since' must be earlier than 'until'".to_string(),
                ));
            }
        }

        let filter = UsageFilter {
            session_id: self.session_id,
            endpoint: self.endpoint,
            since: self.since,
            until: self.until,
            success: self.success,
        };
        Ok((filter, self.limit.unwrap_or(DEFAULT_USAGE_LIMIT)))
    }
}

/// Query the usage log
pub async fn list_usage(
    State(state): State<SharedState>,
    Query(params): Query<UsageParams>,
) -> Result<impl IntoResponse, GovernanceError> {
    let (filter, limit) = params.into_filter()?;

    let entries = state
        .governor
        .recorder()
        .query(filter)
        .limit(limit)
        .collect()
        .await?;

    Ok(Json(UsageResponse::new(entries)))
}

/// The caller's own session, as admitted by the governance middleware
pub async fn current_session(Extension(session): Extension<Session>) -> impl IntoResponse {
    Json(session)
}

/// Total number of tracked sessions
pub async fn session_count(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, GovernanceError> {
    let sessions = state.governor.sessions().count().await?;
    Ok(Json(SessionCountResponse { sessions }))
}

pub async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, GovernanceError> {
    let session = state.governor.sessions().get(&session_id).await?;
    Ok(Json(session))
}

/// Purge sessions past the retention period
pub async fn sweep_sessions(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, GovernanceError> {
    let purged = state.governor.sweep_sessions().await?;
    Ok(Json(SweepResponse {
        purged,
        retention_seconds: state.governor.settings().retention_period.as_secs(),
    }))
}

/// Current window for a key
pub async fn get_rate_limit(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GovernanceError> {
    let status = state.governor.limiter().status(&key).await?;
    Ok(Json(status))
}

/// Drop the counter for a key
pub async fn delete_rate_limit(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GovernanceError> {
    let removed = state.governor.reset_rate_limit(&key).await?;
    Ok(Json(ResetResponse { key, removed }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = if status.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let sessions = state.governor.sessions().ping().await;
    let rate_limits = state.governor.limiter().ping().await;

    match sessions.and(rate_limits) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "connected"
            })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "disconnected",
                "error": err.to_string()
            })),
        ),
    }
}

/// Admission counters
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.governor.metrics())
}
