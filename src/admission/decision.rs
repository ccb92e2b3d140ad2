//! Admission decisions over a tracker.

use super::limits::LimiterConfig;
use super::tracker::Tracker;

/// The verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The request may proceed.
    Accepted,
    /// Less than the minimum interval has passed since the last accepted request.
    TooFast,
    /// The current window's quota is exhausted.
    TooFrequent,
}

/// A verdict together with the tracker state it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// For `Accepted` this is the state to persist. For `TooFast` it is the
    /// loaded tracker untouched. For `TooFrequent` it carries the rolled window
    /// and the incremented count, with `last_accepted_at_millis` untouched.
    pub tracker: Tracker,
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

/// Evaluate a request arriving at `now_millis` against `tracker`.
///
/// The interval check runs first so a burst of too-fast requests never counts
/// against the window quota. The count is incremented before the quota
/// comparison, so the request that would become number `max + 1` is the first
/// one rejected.
pub fn evaluate(mut tracker: Tracker, now_millis: i64, config: &LimiterConfig) -> Decision {
    let min_interval = config.min_request_interval_millis();
    if min_interval > 0 {
        if let Some(elapsed) = tracker.millis_since_last_accept(now_millis) {
            if elapsed < min_interval as i64 {
                return Decision {
                    verdict: Verdict::TooFast,
                    tracker,
                };
            }
        }
    }

    let windowed = config.window_size_millis() > 0;
    if windowed {
        let window_index = config.window_index(now_millis);
        if window_index != tracker.window_index {
            tracker.window_index = window_index;
            tracker.window_count = 0;
        }
    }

    tracker.window_count = tracker.window_count.saturating_add(1);

    if windowed && tracker.window_count > config.max_requests_per_window() {
        return Decision {
            verdict: Verdict::TooFrequent,
            tracker,
        };
    }

    tracker.last_accepted_at_millis = now_millis;
    tracker.expires_at_millis = config.expires_at_millis(now_millis);
    Decision {
        verdict: Verdict::Accepted,
        tracker,
    }
}
