//! Admission decisions and tracker state.

mod controller;
mod decision;
mod gatekeeper;
mod key;
mod limits;
mod rules;
mod tracker;

pub use controller::{AdmissionController, Outcome};
pub use decision::{evaluate, Decision, Verdict};
pub use gatekeeper::Gatekeeper;
pub use key::{KeyDeriver, TrackerKey};
pub use limits::{
    LimiterConfig, LimiterSettings, DEFAULT_EXPIRATION_SECONDS, DEFAULT_MAX_REQUESTS_PER_WINDOW,
    DEFAULT_MIN_REQUEST_INTERVAL_MILLIS, DEFAULT_WINDOW_SIZE_MILLIS,
};
pub use rules::{ResourceRule, RuleMatch, RuleSet, RuleSettings};
pub use tracker::Tracker;
