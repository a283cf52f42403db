//! Violation events emitted when a check is denied.
//!
//! Reporting is fire-and-forget from the decision path: reporters must not
//! block, and a reporter error is logged by the caller and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{BucketgateError, Result};

/// A denied check, as handed to audit and metrics sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    /// Store key of the bucket that ran dry
    pub bucket_key: String,
    /// Rule that denied the request
    pub rule_name: String,
    /// Scope type of the bucket
    pub scope_type: String,
    /// Scope identifier of the bucket
    pub scope_value: String,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Seconds until the request could succeed
    pub retry_after_seconds: f64,
}

impl ViolationEvent {
    /// Convert an epoch-seconds timestamp into the event's timestamp type.
    pub fn timestamp_from_secs(now: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis((now * 1000.0).round() as i64).unwrap_or_default()
    }
}

/// Sink for violation events.
pub trait ViolationReporter: Send + Sync {
    /// Hand off one event. Must not block.
    fn report(&self, event: ViolationEvent) -> Result<()>;
}

/// Writes each violation as a structured `warn` log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogViolationReporter;

impl ViolationReporter for LogViolationReporter {
    fn report(&self, event: ViolationEvent) -> Result<()> {
        warn!(
            target: "bucketgate::violation",
            bucket_key = %event.bucket_key,
            rule = %event.rule_name,
            scope_type = %event.scope_type,
            scope_value = %event.scope_value,
            timestamp = %event.timestamp.to_rfc3339(),
            retry_after_seconds = event.retry_after_seconds,
            "Rate limit violation"
        );
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopViolationReporter;

impl ViolationReporter for NoopViolationReporter {
    fn report(&self, _event: ViolationEvent) -> Result<()> {
        Ok(())
    }
}

/// Forwards events over a bounded channel to an asynchronous consumer,
/// such as an audit log writer.
///
/// When the channel is full the event is dropped and an error returned.
#[derive(Debug, Clone)]
pub struct ChannelViolationReporter {
    sender: mpsc::Sender<ViolationEvent>,
}

impl ChannelViolationReporter {
    /// Create a reporter and the receiving half of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ViolationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl ViolationReporter for ChannelViolationReporter {
    fn report(&self, event: ViolationEvent) -> Result<()> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BucketgateError::Reporter("violation channel is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BucketgateError::Reporter("violation channel is closed".to_string())
            }
        })
    }
}
