//! Routes admissions to the controller configured for each resource.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::controller::{AdmissionController, Outcome};
use super::key::KeyDeriver;
use super::rules::{RuleMatch, RuleSet};
use crate::store::TrackerStore;

/// One [`AdmissionController`] per resource rule, all sharing a single store.
pub struct Gatekeeper<S: TrackerStore> {
    default: AdmissionController<S>,
    rules: Vec<(String, AdmissionController<S>)>,
    rule_set: RuleSet,
}

impl<S: TrackerStore> Gatekeeper<S> {
    pub fn new(store: Arc<S>, rule_set: RuleSet, keys: KeyDeriver) -> Self {
        let default =
            AdmissionController::with_keys(store.clone(), *rule_set.default_config(), keys.clone());
        let rules = rule_set
            .rules()
            .iter()
            .map(|(resource, config)| {
                (
                    resource.clone(),
                    AdmissionController::with_keys(store.clone(), *config, keys.clone()),
                )
            })
            .collect();

        Self {
            default,
            rules,
            rule_set,
        }
    }

    /// The controller governing `resource`.
    pub fn controller_for(&self, resource: &str) -> &AdmissionController<S> {
        match self.rule_set.find(resource) {
            RuleMatch::Rule(index) => &self.rules[index].1,
            RuleMatch::Default => &self.default,
        }
    }

    pub async fn admit(&self, identity: &str, resource: &str, now: DateTime<Utc>) -> Outcome {
        self.controller_for(resource)
            .admit(identity, resource, now)
            .await
    }

    pub async fn admit_within(
        &self,
        identity: &str,
        resource: &str,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> Outcome {
        self.controller_for(resource)
            .admit_within(identity, resource, now, deadline)
            .await
    }
}
