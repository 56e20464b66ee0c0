use super::{StateStore, STATE_TTL};
use crate::error::{LimiterError, Result};
use crate::rate_limit::lua_scripts::SAVE_STATE_SCRIPT;
use crate::rate_limit::types::LimitState;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

/// Default prefix of every state key written to Redis
pub const DEFAULT_KEY_PREFIX: &str = "safelimit:state:";

/// Redis-backed state store shared by every instance
pub struct RedisStateStore {
    /// Redis connection manager
    connection: ConnectionManager,
    /// Prefix prepended to every key
    prefix: String,
    /// Upper bound on a single Redis round trip
    op_timeout: Duration,
    save_script: Script,
}

impl RedisStateStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str, prefix: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                LimiterError::StoreUnavailable(format!(
                    "Timed out connecting to Redis at {}",
                    redis_url
                ))
            })??;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            op_timeout,
            save_script: Script::new(SAVE_STATE_SCRIPT),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(op, error = %e, "Redis error");
                Err(e.into())
            }
            Err(_) => Err(LimiterError::StoreUnavailable(format!(
                "Redis {} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load(&self, key: &str) -> Result<LimitState> {
        let mut conn = self.connection.clone();
        let redis_key = self.redis_key(key);

        let raw: Option<String> = self
            .bounded(
                "GET",
                redis::cmd("GET").arg(&redis_key).query_async(&mut conn),
            )
            .await?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(LimitState::default()),
        }
    }

    async fn save(&self, key: &str, state: &LimitState) -> Result<()> {
        let mut conn = self.connection.clone();
        let redis_key = self.redis_key(key);

        let mut next = state.clone();
        next.revision = state.revision + 1;
        let payload = serde_json::to_string(&next)?;

        let result: Vec<i64> = self
            .bounded(
                "EVALSHA",
                self.save_script
                    .key(&redis_key)
                    .arg(state.revision)
                    .arg(payload)
                    .arg(STATE_TTL.as_secs())
                    .invoke_async(&mut conn),
            )
            .await?;

        match result.first() {
            Some(1) => Ok(()),
            Some(_) => {
                debug!(
                    key = %redis_key,
                    expected = state.revision,
                    current = ?result.get(1),
                    "Revision mismatch on save"
                );
                Err(LimiterError::Conflict(key.to_string()))
            }
            None => Err(LimiterError::Internal(
                "Empty reply from save script".to_string(),
            )),
        }
    }

    async fn cleanup(&self, _now: f64) -> Result<usize> {
        // Records expire on their own STATE_TTL after the last write
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
