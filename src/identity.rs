use crate::error::GovernanceError;
use regex::Regex;
use std::sync::LazyLock;

/// Longest rate limit key the store accepts
pub const MAX_KEY_LENGTH: usize = 100;
/// Longest session token the store accepts
pub const MAX_SESSION_TOKEN_LENGTH: usize = 36;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.:_\-]+$").expect("static key pattern"));

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-]+$").expect("static token pattern"));

/// Who a request comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Only the client address is known
    Ip(String),
    /// The client presented a session token
    Session { token: String, ip: Option<String> },
}

impl Identity {
    pub fn ip(&self) -> Option<&str> {
        match self {
            Identity::Ip(ip) => Some(ip),
            Identity::Session { ip, .. } => ip.as_deref(),
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Identity::Ip(_) => None,
            Identity::Session { token, .. } => Some(token),
        }
    }

    /// Build an identity from the pieces found on a request
    pub fn from_request(token: Option<String>, ip: String) -> Identity {
        match token {
            Some(token) => Identity::Session { token, ip: Some(ip) },
            None => Identity::Ip(ip),
        }
    }
}

/// Validation rules for identity strings
pub struct IdentityValidator;

impl IdentityValidator {
    /// Rate limit keys: IP addresses or session ids
    pub fn validate_key(key: &str) -> Result<(), GovernanceError> {
        if key.is_empty() {
            return Err(GovernanceError::InvalidIdentity(
                "Rate limit key cannot be empty".to_string(),
            ));
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(GovernanceError::InvalidIdentity(format!(
                "Rate limit key exceeds {} characters",
                MAX_KEY_LENGTH
            )));
        }

        if !KEY_PATTERN.is_match(key) {
            return Err(GovernanceError::InvalidIdentity(
                "Rate limit key can only contain alphanumeric characters, dots, colons, hyphens, and underscores".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_session_token(token: &str) -> Result<(), GovernanceError> {
        if token.is_empty() || token.len() > MAX_SESSION_TOKEN_LENGTH {
            return Err(GovernanceError::InvalidIdentity(format!(
                "Session token must be between 1 and {} characters",
                MAX_SESSION_TOKEN_LENGTH
            )));
        }

        if !TOKEN_PATTERN.is_match(token) {
            return Err(GovernanceError::InvalidIdentity(
                "Session token contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate(identity: &Identity) -> Result<(), GovernanceError> {
        match identity {
            Identity::Ip(ip) => Self::validate_key(ip),
            Identity::Session { token, ip } => {
                Self::validate_session_token(token)?;
                if let Some(ip) = ip {
                    Self::validate_key(ip)?;
                }
                Ok(())
            }
        }
    }
}
