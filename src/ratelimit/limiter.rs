//! Rate limiter service: the single entry point for admission checks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::backend::BucketStore;
use super::bucket::{BucketOutcome, BucketState};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use super::rules::{RateLimitRule, RuleSet};
use crate::error::{BucketgateError, Result};
use crate::violation::{NoopViolationReporter, ViolationEvent, ViolationReporter};

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Seconds until enough tokens are available; zero when allowed
    pub retry_after_seconds: f64,
    /// Whole tokens left after this check
    pub remaining_tokens: u64,
    /// Capacity of the rule's bucket
    pub limit: u32,
    /// The store could not be consulted and the request was let through
    pub degraded: bool,
}

impl RateLimitDecision {
    fn from_outcome(outcome: &BucketOutcome, rule: &RateLimitRule) -> Self {
        Self {
            allowed: outcome.allowed,
            retry_after_seconds: outcome.retry_after_secs,
            remaining_tokens: outcome.remaining(),
            limit: rule.max_tokens,
            degraded: false,
        }
    }

    fn fail_open(rule: &RateLimitRule) -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0.0,
            remaining_tokens: 0,
            limit: rule.max_tokens,
            degraded: true,
        }
    }

    /// Value for a `Retry-After` header: whole seconds, rounded up.
    ///
    /// Returns `None` when the request was allowed.
    pub fn retry_after_header(&self) -> Option<u64> {
        if self.allowed {
            None
        } else {
            Some(self.retry_after_seconds.ceil().max(1.0) as u64)
        }
    }
}

/// Token bucket rate limiter over a shared bucket store.
///
/// Holds no mutable state of its own; all serialization happens inside the
/// store's atomic operation, so one instance can be shared across tasks.
pub struct RateLimiterService {
    rules: RuleSet,
    store: Arc<dyn BucketStore>,
    reporter: Arc<dyn ViolationReporter>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiterService {
    /// Create a service with wall-clock time, no violation sink and the default timeout.
    pub fn new(rules: RuleSet, store: Arc<dyn BucketStore>) -> Self {
        Self {
            rules,
            store,
            reporter: Arc::new(NoopViolationReporter),
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Send violation events to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn ViolationReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Take `now` from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each store call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The loaded rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Check and consume `cost` tokens (or the rule's default cost) from the
    /// bucket for `(scope_type, scope_value, rule_name)`.
    ///
    /// Returns `Err` for configuration and validation errors, including any
    /// the store itself reports. Store failures and timeouts produce an
    /// allowed, degraded decision.
    pub async fn check(
        &self,
        scope_type: &str,
        scope_value: &str,
        rule_name: &str,
        cost: Option<u32>,
    ) -> Result<RateLimitDecision> {
        let rule = self.rule(rule_name)?;
        let key = BucketKey::derive(scope_type, scope_value, rule_name)?;
        let cost = Self::resolve_cost(rule_name, rule, cost)?;
        let params = rule.params(cost);
        let now = self.clock.now();

        trace!(key = %key, cost = cost, now = now, "Checking rate limit");

        let call = self.store.take(&key, &params, now);
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_store_error() => return Ok(self.degraded(&key, rule, e)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Ok(self.degraded(&key, rule, BucketgateError::StoreTimeout(self.timeout)))
            }
        };

        let decision = RateLimitDecision::from_outcome(&outcome, rule);

        if !decision.allowed {
            debug!(
                key = %key,
                rule = rule_name,
                retry_after = decision.retry_after_seconds,
                "Rate limit exceeded"
            );
            self.report_violation(&key, now, decision.retry_after_seconds);
        }

        Ok(decision)
    }

    /// Read the stored bucket state for diagnostics.
    pub async fn inspect(
        &self,
        scope_type: &str,
        scope_value: &str,
        rule_name: &str,
    ) -> Result<Option<BucketState>> {
        self.rule(rule_name)?;
        let key = BucketKey::derive(scope_type, scope_value, rule_name)?;
        self.bounded(self.store.get(&key, self.clock.now())).await
    }

    /// Refill a bucket to capacity, as if it had never been used.
    pub async fn reset(&self, scope_type: &str, scope_value: &str, rule_name: &str) -> Result<()> {
        let rule = self.rule(rule_name)?;
        let key = BucketKey::derive(scope_type, scope_value, rule_name)?;
        let now = self.clock.now();
        let state = BucketState::full(rule.max_tokens, now);
        let ttl = rule.params(rule.cost).expiry_secs();

        self.bounded(self.store.set(&key, state, ttl, now)).await?;
        debug!(key = %key, "Bucket reset");
        Ok(())
    }

    /// Check that the store answers within the timeout.
    pub async fn health_check(&self) -> Result<()> {
        self.bounded(self.store.ping()).await
    }

    fn rule(&self, rule_name: &str) -> Result<&RateLimitRule> {
        self.rules
            .get(rule_name)
            .ok_or_else(|| BucketgateError::UnknownRule(rule_name.to_string()))
    }

    fn resolve_cost(rule_name: &str, rule: &RateLimitRule, cost: Option<u32>) -> Result<u32> {
        let cost = cost.unwrap_or(rule.cost);
        if cost == 0 {
            return Err(BucketgateError::Validation(
                "cost must be greater than zero".to_string(),
            ));
        }
        if cost > rule.max_tokens {
            return Err(BucketgateError::CostExceedsCapacity {
                rule: rule_name.to_string(),
                cost,
                max_tokens: rule.max_tokens,
            });
        }
        Ok(cost)
    }

    async fn bounded<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BucketgateError::StoreTimeout(self.timeout))?
    }

    fn degraded(
        &self,
        key: &BucketKey,
        rule: &RateLimitRule,
        error: BucketgateError,
    ) -> RateLimitDecision {
        warn!(
            key = %key,
            rule = key.rule_name(),
            error = %error,
            degraded = true,
            "Bucket store unavailable, failing open"
        );
        RateLimitDecision::fail_open(rule)
    }

    fn report_violation(&self, key: &BucketKey, now: f64, retry_after_seconds: f64) {
        let event = ViolationEvent {
            bucket_key: key.to_string(),
            rule_name: key.rule_name().to_string(),
            scope_type: key.scope_type().to_string(),
            scope_value: key.scope_value().to_string(),
            timestamp: ViolationEvent::timestamp_from_secs(now),
            retry_after_seconds,
        };

        if let Err(e) = self.reporter.report(event) {
            warn!(key = %key, error = %e, "Failed to report rate limit violation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, TokenBucketParams};
    use crate::store::MemoryBucketStore;
    use async_trait::async_trait;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<ViolationEvent>>,
    }

    impl ViolationReporter for RecordingReporter {
        fn report(&self, event: ViolationEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct FailingReporter;

    impl ViolationReporter for FailingReporter {
        fn report(&self, _event: ViolationEvent) -> Result<()> {
            Err(BucketgateError::Reporter("sink down".to_string()))
        }
    }

    /// Counts calls and forwards to an in-memory store.
    struct CountingStore {
        inner: MemoryBucketStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BucketStore for CountingStore {
        async fn take(
            &self,
            key: &BucketKey,
            params: &TokenBucketParams,
            now: f64,
        ) -> Result<BucketOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.take(key, params, now).await
        }

        async fn get(&self, key: &BucketKey, now: f64) -> Result<Option<BucketState>> {
            self.inner.get(key, now).await
        }

        async fn set(
            &self,
            key: &BucketKey,
            state: BucketState,
            ttl_secs: u64,
            now: f64,
        ) -> Result<()> {
            self.inner.set(key, state, ttl_secs, now).await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    enum Broken {
        Unreachable,
        Hangs,
        Rejects,
    }

    #[async_trait]
    impl BucketStore for Broken {
        async fn take(
            &self,
            _key: &BucketKey,
            _params: &TokenBucketParams,
            _now: f64,
        ) -> Result<BucketOutcome> {
            self.fail().await
        }

        async fn get(&self, _key: &BucketKey, _now: f64) -> Result<Option<BucketState>> {
            self.fail().await
        }

        async fn set(
            &self,
            _key: &BucketKey,
            _state: BucketState,
            _ttl: u64,
            _now: f64,
        ) -> Result<()> {
            self.fail().await
        }

        async fn ping(&self) -> Result<()> {
            self.fail().await
        }
    }

    impl Broken {
        async fn fail<T>(&self) -> Result<T> {
            match self {
                Broken::Unreachable => {
                    Err(BucketgateError::Store("connection refused".to_string()))
                }
                Broken::Hangs => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(BucketgateError::Store("late".to_string()))
                }
                Broken::Rejects => Err(BucketgateError::Validation(
                    "store refused the parameters".to_string(),
                )),
            }
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new()
            .with_rule("login", RateLimitRule::new(5, 60.0))
            .unwrap()
            .with_rule("search", RateLimitRule::new(10, 60.0))
            .unwrap()
            .with_rule("upload", RateLimitRule::new(10, 6.0).with_cost(4))
            .unwrap()
    }

    struct Harness {
        service: RateLimiterService,
        clock: Arc<ManualClock>,
        store: Arc<CountingStore>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0.0));
        let store = Arc::new(CountingStore {
            inner: MemoryBucketStore::new(),
            calls: AtomicUsize::new(0),
        });
        let reporter = Arc::new(RecordingReporter::default());
        let service = RateLimiterService::new(rules(), store.clone())
            .with_clock(clock.clone())
            .with_reporter(reporter.clone());

        Harness {
            service,
            clock,
            store,
            reporter,
        }
    }

    fn broken(store: Broken, reporter: Arc<RecordingReporter>) -> RateLimiterService {
        RateLimiterService::new(rules(), Arc::new(store))
            .with_clock(Arc::new(ManualClock::new(0.0)))
            .with_reporter(reporter)
            .with_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let h = harness();

        for expected in [4, 3, 2, 1, 0] {
            let decision = h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
            assert!(decision.allowed);
            assert!(!decision.degraded);
            assert_eq!(decision.remaining_tokens, expected);
            assert_eq!(decision.limit, 5);
        }

        let denied = h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
        assert!(!denied.allowed);
        assert!(!denied.degraded);
        assert!((denied.retry_after_seconds - 1.0).abs() < 1e-9);
        assert_eq!(denied.retry_after_header(), Some(1));
    }

    #[tokio::test]
    async fn test_refill_after_denial() {
        let h = harness();

        for _ in 0..6 {
            h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
        }

        h.clock.set(1.0);
        let decision = h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_tokens, 0);
    }

    #[tokio::test]
    async fn test_unknown_rule_is_a_config_error() {
        let h = harness();

        let err = h.service.check("ip", "10.0.0.1", "nope", None).await.unwrap_err();

        assert!(matches!(err, BucketgateError::UnknownRule(ref name) if name == "nope"));
        assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_call_sees_full_bucket() {
        let h = harness();

        let decision = h.service.check("user", "42", "search", None).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining_tokens, 9);
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let reporter = Arc::new(RecordingReporter::default());
        let service = broken(Broken::Hangs, reporter.clone());

        let decision = service.check("ip", "10.0.0.1", "login", None).await.unwrap();

        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.retry_after_header(), None);
        assert!(reporter.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let reporter = Arc::new(RecordingReporter::default());
        let service = broken(Broken::Unreachable, reporter.clone());

        for _ in 0..10 {
            let decision = service.check("ip", "10.0.0.1", "login", None).await.unwrap();
            assert!(decision.allowed);
            assert!(decision.degraded);
        }
        assert!(reporter.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_non_store_error_from_store_is_returned() {
        let reporter = Arc::new(RecordingReporter::default());
        let service = broken(Broken::Rejects, reporter.clone());

        let err = service.check("ip", "10.0.0.1", "login", None).await.unwrap_err();

        assert!(matches!(err, BucketgateError::Validation(_)));
        assert!(reporter.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_denial_reports_violation() {
        let h = harness();
        h.clock.set(1_700_000_000.0);

        for _ in 0..6 {
            h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
        }

        let events = h.reporter.events.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.bucket_key, "2:ip|8:10.0.0.1|5:login");
        assert_eq!(event.rule_name, "login");
        assert_eq!(event.scope_type, "ip");
        assert_eq!(event.scope_value, "10.0.0.1");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert!((event.retry_after_seconds - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reporter_failure_does_not_change_decision() {
        let service = RateLimiterService::new(rules(), Arc::new(MemoryBucketStore::new()))
            .with_clock(Arc::new(ManualClock::new(0.0)))
            .with_reporter(Arc::new(FailingReporter));

        for _ in 0..5 {
            service.check("ip", "a", "login", None).await.unwrap();
        }
        let decision = service.check("ip", "a", "login", None).await.unwrap();
        assert!(!decision.allowed);
        assert!(!decision.degraded);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_store() {
        let h = harness();

        let empty = h.service.check("ip", "", "login", None).await.unwrap_err();
        assert!(matches!(empty, BucketgateError::Validation(_)));

        let zero = h.service.check("ip", "a", "login", Some(0)).await.unwrap_err();
        assert!(matches!(zero, BucketgateError::Validation(_)));

        let too_big = h.service.check("ip", "a", "login", Some(6)).await.unwrap_err();
        assert!(matches!(
            too_big,
            BucketgateError::CostExceedsCapacity {
                cost: 6,
                max_tokens: 5,
                ..
            }
        ));

        assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rule_default_cost_and_override() {
        let h = harness();

        // upload costs 4 of 10 by default
        let first = h.service.check("user", "7", "upload", None).await.unwrap();
        assert_eq!(first.remaining_tokens, 6);

        let second = h.service.check("user", "7", "upload", Some(1)).await.unwrap();
        assert_eq!(second.remaining_tokens, 5);

        let third = h.service.check("user", "7", "upload", None).await.unwrap();
        assert_eq!(third.remaining_tokens, 1);

        // 3 missing tokens at 0.1 tokens/s
        let denied = h.service.check("user", "7", "upload", None).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_tokens, 1);
        assert!((denied.retry_after_seconds - 30.0).abs() < 1e-6);
        assert_eq!(denied.retry_after_header(), Some(30));
    }

    #[tokio::test]
    async fn test_scopes_have_separate_buckets() {
        let h = harness();

        for _ in 0..5 {
            h.service.check("ip", "10.0.0.1", "login", None).await.unwrap();
        }

        assert!(!h.service.check("ip", "10.0.0.1", "login", None).await.unwrap().allowed);
        assert!(h.service.check("ip", "10.0.0.2", "login", None).await.unwrap().allowed);
        assert!(h.service.check("user", "10.0.0.1", "login", None).await.unwrap().allowed);
        assert!(h.service.check("ip", "10.0.0.1", "search", None).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_respect_capacity() {
        let h = harness();
        let service = Arc::new(h.service);

        let checks = (0..40).map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.check("ip", "shared", "search", None).await })
        });
        let decisions: Vec<RateLimitDecision> = join_all(checks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 10);
        assert_eq!(h.store.calls.load(Ordering::SeqCst), 40);
        assert_eq!(h.reporter.events.lock().len(), 30);
    }

    #[tokio::test]
    async fn test_inspect_and_reset() {
        let h = harness();

        assert_eq!(h.service.inspect("ip", "a", "login").await.unwrap(), None);

        for _ in 0..5 {
            h.service.check("ip", "a", "login", None).await.unwrap();
        }
        let drained = h.service.inspect("ip", "a", "login").await.unwrap().unwrap();
        assert_eq!(drained.tokens, 0.0);

        h.service.reset("ip", "a", "login").await.unwrap();
        let decision = h.service.check("ip", "a", "login", None).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_tokens, 4);
    }

    #[tokio::test]
    async fn test_reset_expiry_follows_service_clock() {
        let h = harness();
        h.clock.set(5_000.0);

        h.service.reset("ip", "a", "login").await.unwrap();
        let state = h.service.inspect("ip", "a", "login").await.unwrap().unwrap();
        assert_eq!(state.last_refill, 5_000.0);

        // login expires 5s refill + 60s buffer after the reset
        h.clock.advance(64.0);
        assert!(h.service.inspect("ip", "a", "login").await.unwrap().is_some());
        h.clock.advance(1.0);
        assert_eq!(h.service.inspect("ip", "a", "login").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness();
        h.service.health_check().await.unwrap();

        let service = broken(Broken::Hangs, Arc::new(RecordingReporter::default()));
        let err = service.health_check().await.unwrap_err();
        assert!(matches!(err, BucketgateError::StoreTimeout(_)));
    }
}
