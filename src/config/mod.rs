use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::error::{LimiterError, Result};
use crate::rate_limit::escalation::EscalationSettings;
use crate::rate_limit::middleware::RouteRule;
use crate::rate_limit::registry::{default_policies, PolicyRegistry};
use crate::rate_limit::store::redis::DEFAULT_KEY_PREFIX;
use crate::rate_limit::types::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared state store; local memory only when absent
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Rate limit policies (built-in defaults when empty)
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    /// Middleware route rules
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    /// Stale state cleanup
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Audit event queue
    #[serde(default)]
    pub audit: AuditConfig,
    /// Suspicious activity heuristic
    #[serde(default)]
    pub escalation: EscalationSettings,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for rate limit state
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    /// Upper bound on a single Redis call
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// How often an unavailable Redis is retried
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl RedisConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Write audit events through the tracing sink
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pending events kept before the oldest is dropped
    #[serde(default = "default_audit_capacity")]
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_redis_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_op_timeout_ms() -> u64 {
    250
}

fn default_probe_interval() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_audit_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LimiterError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Policies in effect, falling back to the built-in set
    pub fn effective_policies(&self) -> Vec<PolicyConfig> {
        if self.policies.is_empty() {
            default_policies()
        } else {
            self.policies.clone()
        }
    }

    /// Build the policy registry
    pub fn registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::new(self.effective_policies())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let registry = self.registry()?;

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(LimiterError::Config(format!(
                    "Route prefix must start with '/': {}",
                    route.prefix
                )));
            }

            if !registry.contains(&route.policy) {
                return Err(LimiterError::Config(format!(
                    "Unknown policy '{}' for route: {}",
                    route.policy, route.prefix
                )));
            }
        }

        if let Some(redis) = &self.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(LimiterError::Config(format!(
                    "Redis URL must start with redis:// or rediss://: {}",
                    redis.url
                )));
            }
            if redis.op_timeout_ms == 0 {
                return Err(LimiterError::Config(
                    "Redis op_timeout_ms must be > 0".to_string(),
                ));
            }
        }

        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(LimiterError::Config(
                "Cleanup interval must be > 0".to_string(),
            ));
        }

        if self.audit.queue_capacity == 0 {
            return Err(LimiterError::Config(
                "Audit queue capacity must be > 0".to_string(),
            ));
        }

        if self.escalation.denial_multiplier == 0 || self.escalation.denial_window_secs == 0 {
            return Err(LimiterError::Config(
                "Escalation multiplier and window must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: None,
            policies: vec![],
            routes: vec![],
            cleanup: CleanupConfig::default(),
            audit: AuditConfig::default(),
            escalation: EscalationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}
