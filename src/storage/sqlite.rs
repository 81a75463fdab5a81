use super::{RateLimitRepository, SessionRepository, UsageRepository};
use crate::error::{GovernanceError, Result};
use crate::models::{
    duration_millis, from_millis, to_millis, NewUsageEntry, RateLimitWindow, Session, UsageFilter,
    UsageLogEntry, Verdict,
};
use crate::rate_limit_config::RateLimitRule;
use crate::rate_limiter::retry_after;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Columns that older databases stored as `DATETIME` text
const TIMESTAMP_COLUMNS: [(&str, &str); 4] = [
    ("sessions", "created_at"),
    ("sessions", "last_activity"),
    ("rate_limits", "window_start"),
    ("usage_logs", "timestamp"),
];

const SESSION_COLUMNS: &str = "session_id, created_at, last_activity, request_count, ip_address";
const USAGE_COLUMNS: &str =
    "id, session_id, endpoint, duration_ms, success, error_message, timestamp, ip_address";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a `sqlite:` URL and bring the schema up to date
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| GovernanceError::Configuration(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` is its own database
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Open (or create) a database file
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GovernanceError::StorageUnavailable(e.to_string()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .busy_timeout(BUSY_TIMEOUT)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create missing tables, reconcile legacy column sets and record the version
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        if current > SCHEMA_VERSION {
            return Err(GovernanceError::Configuration(format!(
                "Database schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                ip_address TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                key TEXT PRIMARY KEY,
                requests INTEGER NOT NULL DEFAULT 0,
                window_start INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT,
                endpoint TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                timestamp INTEGER NOT NULL,
                ip_address TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.add_column_if_missing("sessions", "ip_address", "TEXT").await?;
        self.add_column_if_missing("usage_logs", "error_message", "TEXT").await?;
        self.add_column_if_missing("usage_logs", "ip_address", "TEXT").await?;
        for (table, column) in TIMESTAMP_COLUMNS {
            self.convert_text_timestamps(table, column).await?;
        }

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_sessions_ip ON sessions (ip_address, last_activity)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_activity ON sessions (last_activity)",
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_session ON usage_logs (session_id)",
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_timestamp ON usage_logs (timestamp)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?1)")
            .bind(SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;

        tracing::debug!(version = SCHEMA_VERSION, "SQLite schema ready");
        Ok(())
    }

    async fn add_column_if_missing(&self, table: &str, column: &str, ddl: &str) -> Result<()> {
        let columns: Vec<String> = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<std::result::Result<_, _>>()?;

        if !columns.iter().any(|c| c == column) {
            tracing::info!(table, column, "Adding column missing from legacy schema");
            sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ddl))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Rewrite `DATETIME` text values as Unix milliseconds
    async fn convert_text_timestamps(&self, table: &str, column: &str) -> Result<()> {
        let converted = sqlx::query(&format!(
            "UPDATE {0} SET {1} = CAST(ROUND((julianday({1}) - 2440587.5) * 86400000) AS INTEGER) \
             WHERE typeof({1}) = 'text' AND julianday({1}) IS NOT NULL",
            table, column
        ))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if converted > 0 {
            tracing::info!(table, column, converted, "Converted legacy text timestamps");
        }

        let unparseable: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE typeof({}) = 'text'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if unparseable > 0 {
            return Err(GovernanceError::Configuration(format!(
                "{} rows in {}.{} hold timestamps that cannot be parsed",
                unparseable, table, column
            )));
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn select_one(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        session_id: row.try_get("session_id")?,
        created_at: from_millis(row.try_get("created_at")?),
        last_activity: from_millis(row.try_get("last_activity")?),
        request_count: row.try_get::<Option<i64>, _>("request_count")?.unwrap_or(0).max(0) as u64,
        ip_address: row.try_get("ip_address")?,
    })
}

fn usage_from_row(row: &SqliteRow) -> Result<UsageLogEntry> {
    Ok(UsageLogEntry {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        endpoint: row.try_get("endpoint")?,
        duration_ms: row.try_get::<Option<i64>, _>("duration_ms")?.unwrap_or(0).max(0) as u64,
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        timestamp: from_millis(row.try_get("timestamp")?),
        ip_address: row.try_get("ip_address")?,
    })
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE session_id = ?1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_ip(&self, ip_address: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE ip_address = ?1 ORDER BY last_activity DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(ip_address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (session_id, created_at, last_activity, request_count, ip_address) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.session_id)
        .bind(to_millis(session.created_at))
        .bind(to_millis(session.last_activity))
        .bind(session.request_count as i64)
        .bind(&session.ip_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "UPDATE sessions SET last_activity = MAX(last_activity, ?1), request_count = request_count + 1 \
             WHERE session_id = ?2 RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE last_activity < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.select_one().await
    }
}

#[async_trait]
impl RateLimitRepository for SqliteStore {
    async fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        rule: &RateLimitRule,
    ) -> Result<Verdict> {
        let now_ms = to_millis(now);
        let window_ms = duration_millis(rule.window_length);

        // A single upsert is the serialization point: the conflict branch only
        // updates when the window expired or there is room left, so a missing
        // RETURNING row means the request was denied.
        let accepted = sqlx::query(
            r#"
            INSERT INTO rate_limits (key, requests, window_start) VALUES (?1, 1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                requests = CASE WHEN ?2 - rate_limits.window_start >= ?3 THEN 1
                                ELSE rate_limits.requests + 1 END,
                window_start = CASE WHEN ?2 - rate_limits.window_start >= ?3 THEN ?2
                                    ELSE rate_limits.window_start END
            WHERE ?2 - rate_limits.window_start >= ?3 OR rate_limits.requests < ?4
            RETURNING requests
            "#,
        )
        .bind(key)
        .bind(now_ms)
        .bind(window_ms)
        .bind(rule.max_requests as i64)
        .fetch_optional(&self.pool)
        .await?;

        if accepted.is_some() {
            return Ok(Verdict::Allowed);
        }

        let window_start: Option<i64> =
            sqlx::query_scalar("SELECT window_start FROM rate_limits WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let window_start = window_start.map(from_millis).unwrap_or(now);
        Ok(Verdict::Denied {
            retry_after: retry_after(window_start, now, rule),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let row = sqlx::query("SELECT key, requests, window_start FROM rate_limits WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<RateLimitWindow> {
            Ok(RateLimitWindow {
                key: row.try_get("key")?,
                requests: row.try_get::<i64, _>("requests")?.max(0) as u64,
                window_start: from_millis(row.try_get("window_start")?),
            })
        })
        .transpose()
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<()> {
        self.select_one().await
    }
}

#[async_trait]
impl UsageRepository for SqliteStore {
    async fn append(&self, entry: NewUsageEntry) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO usage_logs (session_id, endpoint, duration_ms, success, error_message, timestamp, ip_address) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&entry.session_id)
        .bind(&entry.endpoint)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(to_millis(entry.timestamp))
        .bind(&entry.ip_address)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn page(
        &self,
        filter: &UsageFilter,
        after_id: i64,
        max_id: i64,
        limit: u32,
    ) -> Result<Vec<UsageLogEntry>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM usage_logs WHERE id > ", USAGE_COLUMNS));
        query.push_bind(after_id);
        query.push(" AND id <= ").push_bind(max_id);

        if let Some(session_id) = &filter.session_id {
            query.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(endpoint) = &filter.endpoint {
            query.push(" AND endpoint = ").push_bind(endpoint.clone());
        }
        if let Some(since) = filter.since {
            query.push(" AND timestamp >= ").push_bind(to_millis(since));
        }
        if let Some(until) = filter.until {
            query.push(" AND timestamp < ").push_bind(to_millis(until));
        }
        if let Some(success) = filter.success {
            query.push(" AND success = ").push_bind(success);
        }

        query.push(" ORDER BY id ASC LIMIT ").push_bind(i64::from(limit));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn max_id(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM usage_logs")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn ping(&self) -> Result<()> {
        self.select_one().await
    }
}
