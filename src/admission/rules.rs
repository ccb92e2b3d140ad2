//! Per-resource limiter rules.
//!
//! A rule set holds a default limiter configuration plus overrides keyed by
//! resource. A resource matches a rule exactly, or falls under it when the rule
//! is a path prefix ending on a `/` boundary; the longest match wins.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::limits::{LimiterConfig, LimiterSettings};
use crate::error::{Result, TurnstileError};

/// Rule settings as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSettings {
    /// Limits applied to resources no rule matches
    #[serde(default)]
    pub default: LimiterSettings,
    /// Resource-specific overrides
    #[serde(default)]
    pub resources: Vec<ResourceRule>,
}

/// Limits for one resource or resource prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Resource path, e.g. `/orders` (also matches `/orders/42`)
    pub resource: String,
    #[serde(flatten)]
    pub limits: LimiterSettings,
}

/// Validated rules, ordered for longest-prefix lookup.
#[derive(Debug, Clone)]
pub struct RuleSet {
    default: LimiterConfig,
    /// (resource, config), longest resource first
    rules: Vec<(String, LimiterConfig)>,
}

/// Which rule a resource resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    /// Index into [`RuleSet::rules`].
    Rule(usize),
    Default,
}

impl RuleSet {
    /// Validate every rule. Duplicate resources and invalid limits are errors.
    pub fn new(settings: &RuleSettings) -> Result<Self> {
        let default = LimiterConfig::new(&settings.default)?;

        let mut rules: Vec<(String, LimiterConfig)> = Vec::with_capacity(settings.resources.len());
        for rule in &settings.resources {
            if rule.resource.is_empty() {
                return Err(TurnstileError::Config(
                    "resource rule with empty resource".to_string(),
                ));
            }
            if rules.iter().any(|(resource, _)| resource == &rule.resource) {
                return Err(TurnstileError::Config(format!(
                    "duplicate resource rule: {}",
                    rule.resource
                )));
            }
            let config = LimiterConfig::new(&rule.limits).map_err(|e| {
                TurnstileError::Config(format!("resource {}: {}", rule.resource, e))
            })?;
            rules.push((rule.resource.clone(), config));
        }
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        info!(rules = rules.len(), "Loaded resource rules");
        Ok(Self { default, rules })
    }

    /// A rule set with only a default.
    pub fn single(default: LimiterConfig) -> Self {
        Self {
            default,
            rules: Vec::new(),
        }
    }

    pub fn default_config(&self) -> &LimiterConfig {
        &self.default
    }

    pub fn rules(&self) -> &[(String, LimiterConfig)] {
        &self.rules
    }

    /// Resolve the rule governing `resource`.
    pub fn find(&self, resource: &str) -> RuleMatch {
        self.rules
            .iter()
            .position(|(rule, _)| covers(rule, resource))
            .map_or(RuleMatch::Default, RuleMatch::Rule)
    }

    /// The configuration governing `resource`.
    pub fn config_for(&self, resource: &str) -> &LimiterConfig {
        match self.find(resource) {
            RuleMatch::Rule(index) => &self.rules[index].1,
            RuleMatch::Default => &self.default,
        }
    }
}

fn covers(rule: &str, resource: &str) -> bool {
    match resource.strip_prefix(rule) {
        Some("") => true,
        Some(rest) => rule.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
