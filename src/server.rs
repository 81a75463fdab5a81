use crate::clock::SystemClock;
use crate::config::{Config, StorageBackend};
use crate::error::Result;
use crate::governance::Governor;
use crate::handlers::{
    current_session, delete_rate_limit, get_rate_limit, get_session, health_check, list_usage,
    metrics, readiness_check, session_count, sweep_sessions, AppState, SharedState,
};
use crate::middleware::{admin_auth_middleware, governance_middleware, logging_middleware};
use crate::storage::{RedisRateLimitStore, SqliteStore, Storage};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    governor: Arc<Governor>,
    sweep_interval: Option<Duration>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let governor = Arc::new(build_governor(&config).await?);
        let state: SharedState = Arc::new(
            AppState::new(governor.clone(), config.session_cookie.clone())
                .with_admin_token(config.admin_token.clone()),
        );
        if state.admin_token.is_none() {
            tracing::info!("ADMIN_TOKEN not set, admin endpoints disabled");
        }

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
            governor,
            sweep_interval: config.sweep_interval(),
        })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Neuber gate listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        let sweeper = self
            .sweep_interval
            .map(|interval| tokio::spawn(sweep_loop(self.governor.clone(), interval)));

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        Ok(())
    }
}

/// Open the configured backends
pub async fn build_storage(config: &Config) -> Result<Storage> {
    let storage = match config.storage_backend {
        StorageBackend::Memory => Storage::in_memory(),
        StorageBackend::Sqlite => {
            let store =
                SqliteStore::connect(&config.database_url, config.database_max_connections).await?;
            tracing::info!(database_url = %config.database_url, "SQLite storage ready");
            Storage::sqlite(store)
        }
    };

    match &config.redis_url {
        Some(redis_url) => {
            let redis = RedisRateLimitStore::connect(redis_url).await?;
            tracing::info!("Rate limit counters stored in Redis");
            Ok(storage.with_rate_limits(Arc::new(redis)))
        }
        None => Ok(storage),
    }
}

pub async fn build_governor(config: &Config) -> Result<Governor> {
    let storage = build_storage(config).await?;
    Governor::new(
        storage,
        Arc::new(SystemClock),
        config.rate_limit_rule(),
        config.governance_settings(),
    )
}

pub fn create_app(state: SharedState) -> Router {
    // Client facing routes: every request is session tracked and rate limited
    let api = Router::new()
        .route("/session", get(current_session))
        .route("/sessions/count", get(session_count))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            governance_middleware,
        ));

    let mut app = Router::new().nest("/api", api);

    // Operator routes: token gated and never counted against a client
    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/sessions/sweep", post(sweep_sessions))
            .route("/sessions/:session_id", get(get_session))
            .route("/usage", get(list_usage))
            .route("/rate-limit/:key", get(get_rate_limit).delete(delete_rate_limit))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                admin_auth_middleware,
            ));
        app = app.nest("/admin", admin);
    }

    app
        // Health, readiness and metrics are not governed
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

async fn sweep_loop(governor: Arc<Governor>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match governor.sweep_sessions().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Swept inactive sessions"),
            Err(err) => tracing::warn!(error = %err, "Session sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
