//! Turnstile - Per-Identity Request Admission Control
//!
//! This crate decides whether a caller may access a resource right now, based
//! on the minimum spacing between its accepted requests and the number of
//! requests it made in the current fixed window. Tracking state lives in a
//! shared backend so that several service instances reach consistent
//! decisions for the same caller.

pub mod admission;
pub mod config;
pub mod error;
pub mod store;
