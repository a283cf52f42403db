//! Bucketgate - Distributed Token Bucket Admission Control
//!
//! This crate enforces per-key request quotas consistently across many
//! application instances. Bucket state lives in a shared store that runs the
//! refill-and-consume step atomically; the service in front of it resolves
//! rules, derives bucket keys, fails open when the store is unavailable and
//! reports denials to a violation sink.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod violation;
