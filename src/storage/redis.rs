use super::RateLimitRepository;
use crate::error::{GovernanceError, Result};
use crate::models::{duration_millis, from_millis, to_millis, RateLimitWindow, Verdict};
use crate::rate_limit_config::RateLimitRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;

const KEY_PREFIX: &str = "neuber:rate_limit";

const FIXED_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'requests', 'window_start')
local requests = tonumber(state[1]) or 0
local start = tonumber(state[2]) or now
if now - start >= window then
  start = now
  requests = 0
end
if requests < max then
  requests = requests + 1
  redis.call('HSET', KEYS[1], 'requests', requests, 'window_start', start)
  redis.call('PEXPIRE', KEYS[1], math.max(start + window - now, 1))
  return {1, requests, start}
end
return {0, requests, start}
"#;

pub struct RedisRateLimitStore {
    connection: MultiplexedConnection,
    script: Script,
}

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            GovernanceError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        let connection = client.get_multiplexed_tokio_connection().await.map_err(|e| {
            GovernanceError::StorageUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            connection,
            script: Script::new(FIXED_WINDOW_SCRIPT),
        })
    }

    fn redis_key(key: &str) -> String {
        format!("{}:{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl RateLimitRepository for RedisRateLimitStore {
    async fn check_and_increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        rule: &RateLimitRule,
    ) -> Result<Verdict> {
        let mut conn = self.connection.clone();
        let (allowed, _requests, window_start): (i64, i64, i64) = self
            .script
            .key(Self::redis_key(key))
            .arg(to_millis(now))
            .arg(duration_millis(rule.window_length))
            .arg(rule.max_requests)
            .invoke_async(&mut conn)
            .await?;

        if allowed == 1 {
            return Ok(Verdict::Allowed);
        }

        Ok(Verdict::Denied {
            retry_after: crate::rate_limiter::retry_after(from_millis(window_start), now, rule),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let mut conn = self.connection.clone();
        let (requests, window_start): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(Self::redis_key(key))
            .arg("requests")
            .arg("window_start")
            .query_async(&mut conn)
            .await?;

        Ok(match (requests, window_start) {
            (Some(requests), Some(window_start)) => Some(RateLimitWindow {
                key: key.to_string(),
                requests: requests.max(0) as u64,
                window_start: from_millis(window_start),
            }),
            _ => None,
        })
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = tokio::time::timeout(
            Duration::from_secs(2),
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| GovernanceError::StorageUnavailable("Redis ping timed out".to_string()))??;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(GovernanceError::StorageUnavailable(format!(
                "Unexpected Redis ping reply: {}",
                pong
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_key_is_namespaced() {
        assert_eq!(
            RedisRateLimitStore::redis_key("192.168.1.1"),
            "neuber:rate_limit:192.168.1.1"
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let result = RedisRateLimitStore::connect("not-a-url").await;
        assert!(matches!(result, Err(GovernanceError::Configuration(_))));
    }
}
