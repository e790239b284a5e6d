//! Core quota engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::backend::AdmissionGate;
use super::dimension::Dimension;
use super::keys::QuotaKeys;
use crate::error::{GuardianError, Result};
use crate::store::{CounterStep, CounterStore};

/// Quotas applied to tokens that have no provisioned totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDefaults {
    /// Requests allowed per cycle
    pub request_quota: i64,
    /// Request bytes allowed per cycle
    pub traffic_quota: i64,
}

impl QuotaDefaults {
    fn for_dimension(&self, dimension: Dimension) -> i64 {
        match dimension {
            Dimension::Request => self.request_quota,
            Dimension::Traffic => self.traffic_quota,
        }
    }
}

/// How an evaluation reads and advances counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Read, compare, then write each counter with separate store calls.
    ///
    /// Concurrent evaluations for the same token may both read the old
    /// counter, so a token can be admitted past its quota.
    #[default]
    BestEffort,
    /// Compare and advance both counters in one atomic store operation.
    ///
    /// A token is never admitted past its quota.
    Strict,
}

/// Totals for a token, as written by [`QuotaEngine::provision`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// New total request quota, if it should change
    pub request_quota: Option<i64>,
    /// New total traffic quota, if it should change
    pub traffic_quota: Option<i64>,
}

/// A token's quotas and counters for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    pub request_quota: i64,
    pub request_count: i64,
    pub traffic_quota: i64,
    pub traffic_bytes: i64,
}

/// One dimension of a token's record, as read during an evaluation.
#[derive(Debug, Clone, Copy)]
struct Usage {
    total: i64,
    current: i64,
}

impl Usage {
    /// `None` is an amount too large for any counter, which never fits.
    fn fits(&self, amount: Option<i64>) -> bool {
        amount
            .and_then(|amount| self.current.checked_add(amount))
            .is_some_and(|next| next <= self.total)
    }
}

/// Decides whether a token's request may proceed.
///
/// The engine holds only its defaults and a store handle; all per-token state
/// lives in the store, so any number of engines may share one store.
pub struct QuotaEngine {
    store: Arc<dyn CounterStore>,
    defaults: QuotaDefaults,
    mode: ConsistencyMode,
}

impl QuotaEngine {
    /// Create a best-effort engine.
    pub fn new(store: Arc<dyn CounterStore>, defaults: QuotaDefaults) -> Self {
        Self::with_mode(store, defaults, ConsistencyMode::default())
    }

    /// Create an engine with an explicit consistency mode.
    pub fn with_mode(
        store: Arc<dyn CounterStore>,
        defaults: QuotaDefaults,
        mode: ConsistencyMode,
    ) -> Self {
        Self {
            store,
            defaults,
            mode,
        }
    }

    /// Get the configured defaults.
    pub fn defaults(&self) -> QuotaDefaults {
        self.defaults
    }

    /// Get the consistency mode.
    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    /// Check both quotas for `token` and, if both fit, count the request.
    ///
    /// Returns `Ok(false)` when either quota would be exceeded; a denied
    /// request leaves every counter unchanged. A size beyond `i64::MAX`
    /// exceeds any traffic quota and is denied. Store failures are returned
    /// as errors and never read as a denial.
    pub async fn evaluate(&self, token: &str, request_bytes: u64) -> Result<bool> {
        let size = i64::try_from(request_bytes).ok();
        let keys = QuotaKeys::new(token);

        trace!(
            token = %keys,
            request_bytes = request_bytes,
            mode = ?self.mode,
            "Evaluating request"
        );

        let admitted = match self.mode {
            ConsistencyMode::BestEffort => self.evaluate_best_effort(&keys, size).await?,
            ConsistencyMode::Strict => self.evaluate_strict(&keys, size).await?,
        };

        if !admitted {
            debug!(token = %keys, request_bytes = request_bytes, "Request denied");
        }
        Ok(admitted)
    }

    async fn evaluate_best_effort(&self, keys: &QuotaKeys, size: Option<i64>) -> Result<bool> {
        let requests = self.read_usage(keys, Dimension::Request).await?;
        if !requests.fits(Some(1)) {
            debug!(
                token = %keys,
                dimension = %Dimension::Request,
                current = requests.current,
                total = requests.total,
                "Quota exceeded"
            );
            return Ok(false);
        }

        let traffic = self.read_usage(keys, Dimension::Traffic).await?;
        let size = match size {
            Some(size) if traffic.fits(Some(size)) => size,
            _ => {
                debug!(
                    token = %keys,
                    dimension = %Dimension::Traffic,
                    current = traffic.current,
                    total = traffic.total,
                    "Quota exceeded"
                );
                return Ok(false);
            }
        };

        // Both fit; only now is anything counted.
        self.store
            .set_key(&keys.current(Dimension::Request), requests.current + 1)
            .await?;
        self.store
            .set_key(&keys.current(Dimension::Traffic), traffic.current + size)
            .await?;

        Ok(true)
    }

    async fn evaluate_strict(&self, keys: &QuotaKeys, size: Option<i64>) -> Result<bool> {
        let Some(size) = size else {
            debug!(token = %keys, dimension = %Dimension::Traffic, "Quota exceeded");
            return Ok(false);
        };
        let steps = [
            self.step(keys, Dimension::Request, 1),
            self.step(keys, Dimension::Traffic, size),
        ];
        Ok(self.store.check_and_increment(&steps).await?)
    }

    fn step(&self, keys: &QuotaKeys, dimension: Dimension, amount: i64) -> CounterStep {
        CounterStep {
            total_key: keys.total(dimension),
            current_key: keys.current(dimension),
            default_total: self.defaults.for_dimension(dimension),
            amount,
        }
    }

    /// Read one dimension, creating its counter at zero if it is missing.
    async fn read_usage(&self, keys: &QuotaKeys, dimension: Dimension) -> Result<Usage> {
        let total = self.read_total(keys, dimension).await?;

        let current_key = keys.current(dimension);
        let current = match self.store.get_key(&current_key).await {
            Ok(value) => value,
            Err(err) if err.is_not_found() => {
                trace!(key = %current_key, "Initializing counter");
                self.store.set_key(&current_key, 0).await?;
                0
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Usage { total, current })
    }

    /// Read a provisioned total, falling back to the default without storing it.
    async fn read_total(&self, keys: &QuotaKeys, dimension: Dimension) -> Result<i64> {
        let key = keys.total(dimension);
        match self.store.get_key(&key).await {
            Ok(total) => Ok(total),
            Err(err) if err.is_not_found() => {
                let total = self.defaults.for_dimension(dimension);
                trace!(key = %key, total = total, "Using default quota");
                Ok(total)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Clear every counter and provisioned total, starting a new cycle.
    pub async fn reset_cycle(&self) -> Result<()> {
        self.store.flush_data().await?;
        info!(store = %self.store.store_type(), "Quota cycle reset");
        Ok(())
    }

    /// Write the provisioned totals for a token.
    pub async fn provision(&self, token: &str, limits: QuotaLimits) -> Result<()> {
        let keys = QuotaKeys::new(token);
        let updates = [
            (Dimension::Request, limits.request_quota),
            (Dimension::Traffic, limits.traffic_quota),
        ];

        for (dimension, total) in updates {
            let Some(total) = total else { continue };
            if total < 0 {
                return Err(GuardianError::InvalidRequest(format!(
                    "{dimension} quota must not be negative, got {total}"
                )));
            }
            self.store.set_key(&keys.total(dimension), total).await?;
            info!(token = %keys, dimension = %dimension, total = total, "Quota provisioned");
        }
        Ok(())
    }

    /// Read a token's record without modifying the store.
    pub async fn usage(&self, token: &str) -> Result<QuotaRecord> {
        let keys = QuotaKeys::new(token);

        let request_quota = self.read_total(&keys, Dimension::Request).await?;
        let request_count = self.read_current(&keys, Dimension::Request).await?;
        let traffic_quota = self.read_total(&keys, Dimension::Traffic).await?;
        let traffic_bytes = self.read_current(&keys, Dimension::Traffic).await?;

        Ok(QuotaRecord {
            request_quota,
            request_count,
            traffic_quota,
            traffic_bytes,
        })
    }

    async fn read_current(&self, keys: &QuotaKeys, dimension: Dimension) -> Result<i64> {
        match self.store.get_key(&keys.current(dimension)).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl AdmissionGate for QuotaEngine {
    async fn evaluate(&self, token: &str, request_bytes: u64) -> Result<bool> {
        self.evaluate(token, request_bytes).await
    }

    async fn reset_cycle(&self) -> Result<()> {
        self.reset_cycle().await
    }

    async fn provision(&self, token: &str, limits: QuotaLimits) -> Result<()> {
        self.provision(token, limits).await
    }

    async fn usage(&self, token: &str) -> Result<QuotaRecord> {
        self.usage(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, StoreType};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const DEFAULTS: QuotaDefaults = QuotaDefaults {
        request_quota: 5,
        traffic_quota: 10,
    };

    fn engine_with(mode: ConsistencyMode) -> (QuotaEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = QuotaEngine::with_mode(store.clone(), DEFAULTS, mode);
        (engine, store)
    }

    fn engine() -> (QuotaEngine, Arc<MemoryStore>) {
        engine_with(ConsistencyMode::BestEffort)
    }

    /// Delegates to a memory store, yielding to the scheduler after every call
    /// so that concurrent evaluations interleave between reads and writes.
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl CounterStore for YieldingStore {
        async fn get_key(&self, key: &str) -> std::result::Result<i64, StoreError> {
            let value = self.inner.get_key(key).await;
            tokio::task::yield_now().await;
            value
        }

        async fn set_key(&self, key: &str, value: i64) -> std::result::Result<(), StoreError> {
            let result = self.inner.set_key(key, value).await;
            tokio::task::yield_now().await;
            result
        }

        async fn flush_data(&self) -> std::result::Result<(), StoreError> {
            self.inner.flush_data().await
        }

        async fn check_and_increment(
            &self,
            steps: &[CounterStep],
        ) -> std::result::Result<bool, StoreError> {
            let result = self.inner.check_and_increment(steps).await;
            tokio::task::yield_now().await;
            result
        }

        fn store_type(&self) -> StoreType {
            StoreType::Memory
        }
    }

    /// A store whose backend can be switched off mid-test.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> std::result::Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn get_key(&self, key: &str) -> std::result::Result<i64, StoreError> {
            self.check()?;
            self.inner.get_key(key).await
        }

        async fn set_key(&self, key: &str, value: i64) -> std::result::Result<(), StoreError> {
            self.check()?;
            self.inner.set_key(key, value).await
        }

        async fn flush_data(&self) -> std::result::Result<(), StoreError> {
            self.check()?;
            self.inner.flush_data().await
        }

        async fn check_and_increment(
            &self,
            steps: &[CounterStep],
        ) -> std::result::Result<bool, StoreError> {
            self.check()?;
            self.inner.check_and_increment(steps).await
        }

        fn store_type(&self) -> StoreType {
            StoreType::Memory
        }
    }

    #[tokio::test]
    async fn test_request_quota_scenario() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let (engine, _) = engine_with(mode);

            for i in 1..=5 {
                assert!(engine.evaluate("tokA", 1).await.unwrap(), "request {} ({:?})", i, mode);
            }
            assert!(!engine.evaluate("tokA", 1).await.unwrap());

            engine.reset_cycle().await.unwrap();
            assert!(engine.evaluate("tokA", 1).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_traffic_quota_scenario() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let (engine, _) = engine_with(mode);

            assert!(engine.evaluate("tokB", 4).await.unwrap());
            assert!(engine.evaluate("tokB", 4).await.unwrap());
            // Would reach 12.
            assert!(!engine.evaluate("tokB", 4).await.unwrap());
            // Exactly at quota.
            assert!(engine.evaluate("tokB", 2).await.unwrap());

            let record = engine.usage("tokB").await.unwrap();
            assert_eq!(record.traffic_bytes, 10);
            assert_eq!(record.request_count, 3);
        }
    }

    #[tokio::test]
    async fn test_exactly_quota_zero_sized_requests_admitted() {
        let (engine, _) = engine();

        for _ in 0..DEFAULTS.request_quota {
            assert!(engine.evaluate("zero", 0).await.unwrap());
        }
        assert!(!engine.evaluate("zero", 0).await.unwrap());

        let record = engine.usage("zero").await.unwrap();
        assert_eq!(record.request_count, DEFAULTS.request_quota);
        assert_eq!(record.traffic_bytes, 0);
    }

    #[tokio::test]
    async fn test_oversized_request_denied_outright() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let (engine, _) = engine_with(mode);

            assert!(!engine.evaluate("big", 11).await.unwrap());
            // Nothing was consumed, so a small request still fits.
            assert!(engine.evaluate("big", 10).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_denial_does_not_mutate_counters() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let (engine, _) = engine_with(mode);

            engine.evaluate("tokC", 8).await.unwrap();
            let before = engine.usage("tokC").await.unwrap();

            // Traffic denial must not consume a request unit either.
            assert!(!engine.evaluate("tokC", 3).await.unwrap());
            assert_eq!(engine.usage("tokC").await.unwrap(), before);

            for _ in 0..4 {
                engine.evaluate("tokC", 0).await.unwrap();
            }
            let before = engine.usage("tokC").await.unwrap();
            assert_eq!(before.request_count, 5);

            // Request denial.
            assert!(!engine.evaluate("tokC", 0).await.unwrap());
            assert_eq!(engine.usage("tokC").await.unwrap(), before);
        }
    }

    #[tokio::test]
    async fn test_provisioned_total_overrides_default() {
        let (engine, store) = engine();
        store.set_key("quota:request:total:tokD", 3).await.unwrap();

        for _ in 0..3 {
            assert!(engine.evaluate("tokD", 1).await.unwrap());
        }
        assert!(!engine.evaluate("tokD", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_writes_totals() {
        let (engine, store) = engine_with(ConsistencyMode::Strict);

        let limits = QuotaLimits {
            request_quota: Some(2),
            traffic_quota: Some(100),
        };
        assert_ok!(engine.provision("tokE", limits).await);

        assert_eq!(store.get_key("quota:request:total:tokE").await.unwrap(), 2);
        assert_eq!(store.get_key("quota:traffic:total:tokE").await.unwrap(), 100);

        assert!(engine.evaluate("tokE", 50).await.unwrap());
        assert!(engine.evaluate("tokE", 50).await.unwrap());
        assert!(!engine.evaluate("tokE", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_partial_and_negative() {
        let (engine, store) = engine();

        let limits = QuotaLimits {
            request_quota: None,
            traffic_quota: Some(7),
        };
        engine.provision("tokF", limits).await.unwrap();
        assert!(store.get_key("quota:request:total:tokF").await.unwrap_err().is_not_found());

        let limits = QuotaLimits {
            request_quota: Some(-1),
            traffic_quota: None,
        };
        let err = assert_err!(engine.provision("tokF", limits).await);
        assert!(matches!(err, GuardianError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_default_is_not_persisted() {
        let (engine, store) = engine();

        engine.evaluate("tokG", 1).await.unwrap();

        assert!(store.get_key("quota:request:total:tokG").await.unwrap_err().is_not_found());
        assert!(store.get_key("quota:traffic:total:tokG").await.unwrap_err().is_not_found());
        assert_eq!(store.get_key("quota:request:current:tokG").await.unwrap(), 1);
        assert_eq!(store.get_key("quota:traffic:current:tokG").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_first_read_initializes_counter() {
        let (engine, store) = engine();

        // Denied on the request check, but the counter now exists at zero.
        store.set_key("quota:request:total:tokH", 0).await.unwrap();
        assert!(!engine.evaluate("tokH", 0).await.unwrap());
        assert_eq!(store.get_key("quota:request:current:tokH").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_forgets_everything() {
        let (engine, store) = engine();

        for _ in 0..5 {
            engine.evaluate("tokI", 2).await.unwrap();
        }
        assert!(!engine.evaluate("tokI", 0).await.unwrap());

        engine.reset_cycle().await.unwrap();
        assert!(store.is_empty());

        let record = engine.usage("tokI").await.unwrap();
        assert_eq!(
            record,
            QuotaRecord {
                request_quota: 5,
                request_count: 0,
                traffic_quota: 10,
                traffic_bytes: 0,
            }
        );
        assert!(engine.evaluate("tokI", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_tokens_are_independent() {
        let (engine, _) = engine();

        assert!(engine.evaluate("", 10).await.unwrap());
        assert!(!engine.evaluate("", 1).await.unwrap());
        assert!(engine.evaluate("other", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_with_colon() {
        let (engine, store) = engine();

        assert!(engine.evaluate("localhost:8080", 3).await.unwrap());
        assert_eq!(
            store.get_key("quota:traffic:current:localhost%3A8080").await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_size_beyond_i64_is_denied() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let (engine, store) = engine_with(mode);
            // Even the largest possible quota cannot hold such a request.
            store.set_key("quota:traffic:total:tokJ", i64::MAX).await.unwrap();

            for request_bytes in [i64::MAX as u64 + 1, u64::MAX] {
                assert!(!engine.evaluate("tokJ", request_bytes).await.unwrap(), "{:?}", mode);
            }

            let record = engine.usage("tokJ").await.unwrap();
            assert_eq!(record.request_count, 0);
            assert_eq!(record.traffic_bytes, 0);

            assert!(engine.evaluate("tokJ", i64::MAX as u64).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_counter_overflow_is_denied() {
        let (engine, store) = engine();
        store.set_key("quota:traffic:total:tokK", i64::MAX).await.unwrap();
        store.set_key("quota:traffic:current:tokK", i64::MAX - 1).await.unwrap();

        assert!(!engine.evaluate("tokK", 2).await.unwrap());
        assert!(engine.evaluate("tokK", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_value_is_an_error() {
        struct Corrupt;

        #[async_trait]
        impl CounterStore for Corrupt {
            async fn get_key(&self, key: &str) -> std::result::Result<i64, StoreError> {
                Err(StoreError::ValueParse {
                    key: key.to_string(),
                    value: "abc".to_string(),
                })
            }
            async fn set_key(&self, _: &str, _: i64) -> std::result::Result<(), StoreError> {
                Ok(())
            }
            async fn flush_data(&self) -> std::result::Result<(), StoreError> {
                Ok(())
            }
            async fn check_and_increment(
                &self,
                _: &[CounterStep],
            ) -> std::result::Result<bool, StoreError> {
                Ok(true)
            }
            fn store_type(&self) -> StoreType {
                StoreType::Memory
            }
        }

        let engine = QuotaEngine::new(Arc::new(Corrupt), DEFAULTS);
        let err = assert_err!(engine.evaluate("tokL", 1).await);
        assert!(matches!(err, GuardianError::Store(StoreError::ValueParse { .. })));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_denial() {
        for mode in [ConsistencyMode::BestEffort, ConsistencyMode::Strict] {
            let store = Arc::new(FlakyStore::default());
            let engine = QuotaEngine::with_mode(store.clone(), DEFAULTS, mode);

            assert!(engine.evaluate("tokM", 1).await.unwrap());

            store.down.store(true, Ordering::SeqCst);
            let err = assert_err!(engine.evaluate("tokM", 1).await);
            assert!(matches!(err, GuardianError::Store(StoreError::Unavailable(_))));
            assert_err!(engine.reset_cycle().await);
            assert_err!(engine.usage("tokM").await);

            store.down.store(false, Ordering::SeqCst);
            assert_eq!(engine.usage("tokM").await.unwrap().request_count, 1);
        }
    }

    #[tokio::test]
    async fn test_best_effort_can_over_admit_under_concurrency() {
        let store = Arc::new(YieldingStore {
            inner: MemoryStore::new(),
        });
        let engine = QuotaEngine::new(
            store.clone(),
            QuotaDefaults {
                request_quota: 1,
                traffic_quota: 100,
            },
        );

        // Both evaluations read the counter before either writes it back.
        let results = join_all((0..2).map(|_| engine.evaluate("race", 1))).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 2);
        assert_eq!(engine.usage("race").await.unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn test_strict_never_over_admits_under_concurrency() {
        let store = Arc::new(YieldingStore {
            inner: MemoryStore::new(),
        });
        let engine = QuotaEngine::with_mode(
            store.clone(),
            QuotaDefaults {
                request_quota: 3,
                traffic_quota: 100,
            },
            ConsistencyMode::Strict,
        );

        let results = join_all((0..10).map(|_| engine.evaluate("race", 1))).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 3);
        assert_eq!(engine.usage("race").await.unwrap().request_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_strict_across_tasks() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(QuotaEngine::with_mode(
            store,
            QuotaDefaults {
                request_quota: 50,
                traffic_quota: 1_000,
            },
            ConsistencyMode::Strict,
        ));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.evaluate("shared", 1).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 50);
    }
}
