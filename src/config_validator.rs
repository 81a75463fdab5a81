use crate::config::{Config, StorageBackend};
use crate::error::GovernanceError;

const MIN_ADMIN_TOKEN_LENGTH: usize = 16;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), GovernanceError> {
        if url.is_empty() {
            return Err(GovernanceError::Configuration(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(GovernanceError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a SQLite database URL
    pub fn validate_database_url(url: &str) -> Result<(), GovernanceError> {
        if !url.starts_with("sqlite:") {
            return Err(GovernanceError::Configuration(
                "Database URL must start with 'sqlite:'".to_string(),
            ));
        }

        if url.trim_start_matches("sqlite:").trim_start_matches("//").is_empty() {
            return Err(GovernanceError::Configuration(
                "Database URL must name a file or ':memory:'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates rate limit parameters
    pub fn validate_rate_limit(window_secs: u64, max_requests: u64) -> Result<(), GovernanceError> {
        if window_secs == 0 {
            return Err(GovernanceError::Configuration(
                "Rate limit window must be greater than 0 seconds".to_string(),
            ));
        }

        if max_requests == 0 {
            return Err(GovernanceError::Configuration(
                "Rate limit requests must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_session_cookie(name: &str) -> Result<(), GovernanceError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(GovernanceError::Configuration(format!(
                "Invalid session cookie name '{}'",
                name
            )));
        }
        Ok(())
    }

    pub fn validate_admin_token(token: &str) -> Result<(), GovernanceError> {
        if token.trim().len() < MIN_ADMIN_TOKEN_LENGTH {
            return Err(GovernanceError::Configuration(format!(
                "Admin token must be at least {} characters",
                MIN_ADMIN_TOKEN_LENGTH
            )));
        }
        Ok(())
    }

    pub fn validate_log_level(level: &str) -> Result<(), GovernanceError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(GovernanceError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid_levels
            )));
        }

        Ok(())
    }

    /// Validates the whole service configuration
    pub fn validate_config(config: &Config) -> Result<(), GovernanceError> {
        if config.bind_addr.port() == 0 {
            return Err(GovernanceError::Configuration(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if config.storage_backend == StorageBackend::Sqlite {
            Self::validate_database_url(&config.database_url)?;
            if config.database_max_connections == 0 {
                return Err(GovernanceError::Configuration(
                    "Database pool needs at least one connection".to_string(),
                ));
            }
        }

        if let Some(redis_url) = &config.redis_url {
            Self::validate_redis_url(redis_url)?;
        }

        Self::validate_rate_limit(config.rate_limit_window_secs, config.rate_limit_requests)?;

        if config.session_retention_secs == 0 {
            return Err(GovernanceError::Configuration(
                "Session retention must be greater than 0 seconds".to_string(),
            ));
        }

        if let Some(admin_token) = &config.admin_token {
            Self::validate_admin_token(admin_token)?;
        }

        Self::validate_session_cookie(&config.session_cookie)?;
        Self::validate_log_level(&config.log_level)?;

        Ok(())
    }
}
