use super::types::PolicyConfig;
use crate::error::{LimiterError, Result};
use std::collections::HashMap;
use tracing::debug;

/// Read-only mapping from policy name to its configuration
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, PolicyConfig>,
}

impl PolicyRegistry {
    /// Build a registry, validating every policy
    pub fn new(policies: Vec<PolicyConfig>) -> Result<Self> {
        let mut map = HashMap::with_capacity(policies.len());

        for policy in policies {
            policy.validate()?;
            debug!(
                policy = %policy.name,
                algorithm = policy.algorithm.as_str(),
                child_safe = policy.child_safe_mode,
                "Registering rate limit policy"
            );

            if map.contains_key(&policy.name) {
                return Err(LimiterError::Validation(format!(
                    "Duplicate policy name: {}",
                    policy.name
                )));
            }
            map.insert(policy.name.clone(), policy);
        }

        Ok(Self { policies: map })
    }

    /// Built-in policy set
    pub fn with_defaults() -> Self {
        let policies = default_policies()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self { policies }
    }

    /// Look up a policy by name
    pub fn get_policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Policy names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Policies used when the configuration does not define any
pub fn default_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig::sliding_window("default", 100, 60),
        PolicyConfig::fixed_window("auth_login", 5, 300).with_block_duration(900),
        PolicyConfig::sliding_window("child_interaction", 30, 60)
            .with_block_duration(3600)
            .child_safe(),
        PolicyConfig::token_bucket("child_content", 10, 0.1)
            .with_block_duration(1800)
            .child_safe(),
        PolicyConfig::token_bucket("api_general", 60, 1.0),
    ]
}
