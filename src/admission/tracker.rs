//! Per (identity, resource) request tracking state.

use serde::{Deserialize, Serialize};

use super::limits::LimiterConfig;

/// Counters and timestamps remembered for one identity on one resource.
///
/// Field names here are the backend-agnostic shape; each store chooses its own
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    /// Caller-supplied identity
    pub identity: String,
    /// Path or operation being limited
    pub resource: String,
    /// Index of the fixed window the count belongs to
    pub window_index: i64,
    /// Accepted requests recorded in `window_index`
    pub window_count: u64,
    /// Epoch millis of the last accepted request, 0 when never accepted
    pub last_accepted_at_millis: i64,
    /// Epoch millis after which the backend may reclaim the record
    pub expires_at_millis: i64,
}

impl Tracker {
    /// A tracker for a pair that has never been seen, positioned in the window containing `now_millis`.
    pub fn fresh(identity: &str, resource: &str, now_millis: i64, config: &LimiterConfig) -> Self {
        Self {
            identity: identity.to_string(),
            resource: resource.to_string(),
            window_index: config.window_index(now_millis),
            window_count: 0,
            last_accepted_at_millis: 0,
            expires_at_millis: config.expires_at_millis(now_millis),
        }
    }

    /// Whether any request has ever been accepted for this pair.
    pub fn has_accepted(&self) -> bool {
        self.last_accepted_at_millis != 0
    }

    /// Milliseconds elapsed since the last accepted request, or `None` if there was none.
    pub fn millis_since_last_accept(&self, now_millis: i64) -> Option<i64> {
        self.has_accepted()
            .then(|| now_millis.saturating_sub(self.last_accepted_at_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::limits::LimiterSettings;

    #[test]
    fn test_fresh_tracker() {
        let config = LimiterConfig::default();
        let tracker = Tracker::fresh("u1", "/a", 125_000, &config);

        assert_eq!(tracker.identity, "u1");
        assert_eq!(tracker.resource, "/a");
        assert_eq!(tracker.window_index, 2);
        assert_eq!(tracker.window_count, 0);
        assert!(!tracker.has_accepted());
        assert_eq!(tracker.expires_at_millis, 125_000 + 3_600_000);
    }

    #[test]
    fn test_fresh_tracker_without_windows() {
        let settings = LimiterSettings {
            window_size_millis: 0,
            ..Default::default()
        };
        let config = LimiterConfig::new(&settings).unwrap();
        let tracker = Tracker::fresh("u1", "/a", 125_000, &config);
        assert_eq!(tracker.window_index, 0);
    }

    #[test]
    fn test_millis_since_last_accept() {
        let mut tracker = Tracker::fresh("u1", "/a", 1_000, &LimiterConfig::default());
        assert_eq!(tracker.millis_since_last_accept(5_000), None);

        tracker.last_accepted_at_millis = 4_000;
        assert_eq!(tracker.millis_since_last_accept(5_000), Some(1_000));
    }
}
