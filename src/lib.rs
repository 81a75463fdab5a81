pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod governance;
pub mod handlers;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod session;
pub mod storage;
pub mod usage;

pub use config::Config;
pub use error::{GovernanceError, Result};
pub use governance::{Admission, GovernanceSettings, Governor};
pub use identity::Identity;
pub use models::{NewUsageEntry, Session, UsageFilter, UsageLogEntry, Verdict};
pub use rate_limit_config::RateLimitRule;
pub use server::create_app;
