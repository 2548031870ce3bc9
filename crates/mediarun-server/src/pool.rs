//! Memory-budgeted pool of resident model instances.
//!
//! The pool keeps loaded models around between requests and evicts the least
//! recently used idle model when a new one does not fit the budget. Footprints
//! are reserved before a load starts, so the budget holds even while loads are
//! in flight.
//!
//! Bookkeeping lives behind a single `std::sync::Mutex` that is never held
//! across an `.await` or a load. Each resident instance sits behind its own
//! `tokio::sync::Mutex`, which gives at most one invocation per instance while
//! distinct models run independently.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::{debug, info, warn};

use mediarun_core::ModelKind;

use crate::backend::{BackendError, ModelInstance, ModelLoader};
use crate::config::PoolConfig;

type SharedInstance = Arc<AsyncMutex<Box<dyn ModelInstance>>>;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No loader registered for model {0}")]
    LoaderNotFound(ModelKind),

    #[error("Model {model} needs {required} memory units but the budget is {budget}")]
    InsufficientBudget {
        model: ModelKind,
        required: u64,
        budget: u64,
    },

    #[error("Failed to load model {model}: {source}")]
    LoadFailed {
        model: ModelKind,
        #[source]
        source: BackendError,
    },

    #[error("Loader for model {0} panicked")]
    LoadPanicked(ModelKind),
}

/// Cumulative pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
}

/// One resident (or loading) model in a [`PoolSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentModel {
    pub model: ModelKind,
    pub footprint: u64,
    pub pinned: bool,
    pub loading: bool,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub budget: u64,
    pub used: u64,
    /// Least recently used first.
    pub resident: Vec<ResidentModel>,
    pub stats: PoolStats,
}

impl PoolSnapshot {
    /// Resident models in LRU order.
    pub fn models(&self) -> Vec<ModelKind> {
        self.resident.iter().map(|r| r.model).collect()
    }
}

struct Registration {
    footprint: u64,
    loader: Arc<dyn ModelLoader>,
}

enum Slot {
    Loading,
    Ready(SharedInstance),
}

struct Entry {
    footprint: u64,
    last_used: u64,
    pins: usize,
    slot: Slot,
}

impl Entry {
    fn is_evictable(&self) -> bool {
        self.pins == 0 && matches!(self.slot, Slot::Ready(_))
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ModelKind, Entry>,
    used: u64,
    tick: u64,
    stats: PoolStats,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled whenever a lease is dropped or a load finishes either way.
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Acquire {
    Hit(SharedInstance),
    Wait,
    Load(Vec<(ModelKind, SharedInstance)>),
}

/// Bounded cache of loaded model instances.
pub struct ModelPool {
    budget: u64,
    loaders: HashMap<ModelKind, Registration>,
    shared: Arc<Shared>,
}

impl ModelPool {
    /// Create an empty pool with the given budget and no loaders.
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            loaders: HashMap::new(),
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Register `loader` for `model` with the given footprint.
    pub fn with_loader(
        mut self,
        model: ModelKind,
        footprint: u64,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        self.loaders
            .insert(model, Registration { footprint, loader });
        self
    }

    /// Register one loader for every model, with footprints from `config`.
    pub fn from_config(config: &PoolConfig, loader: Arc<dyn ModelLoader>) -> Self {
        ModelKind::ALL
            .into_iter()
            .fold(Self::new(config.budget), |pool, model| {
                pool.with_loader(model, config.footprint(model), loader.clone())
            })
    }

    /// Check that every model has a loader whose footprint fits the budget.
    pub fn validate(&self) -> Result<(), PoolError> {
        for model in ModelKind::ALL {
            let footprint = self.footprint(model)?;
            if footprint > self.budget {
                return Err(PoolError::InsufficientBudget {
                    model,
                    required: footprint,
                    budget: self.budget,
                });
            }
        }
        Ok(())
    }

    fn footprint(&self, model: ModelKind) -> Result<u64, PoolError> {
        self.loaders
            .get(&model)
            .map(|r| r.footprint)
            .ok_or(PoolError::LoaderNotFound(model))
    }

    /// Get a lease on a loaded instance of `model`, loading it if needed.
    ///
    /// Waits while the model is being loaded by another caller, and while the
    /// budget can only be met by evicting models that are currently leased.
    pub async fn get(&self, model: ModelKind) -> Result<ModelLease, PoolError> {
        let registration = self
            .loaders
            .get(&model)
            .ok_or(PoolError::LoaderNotFound(model))?;
        let footprint = registration.footprint;
        if footprint > self.budget {
            return Err(PoolError::InsufficientBudget {
                model,
                required: footprint,
                budget: self.budget,
            });
        }

        let evicted = loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not missed.
            notified.as_mut().enable();

            match self.try_acquire(model, footprint) {
                Acquire::Hit(instance) => {
                    debug!(model = %model, "Pool hit");
                    return Ok(ModelLease::new(self.shared.clone(), model, instance));
                }
                Acquire::Wait => {
                    debug!(model = %model, "Waiting for pool capacity");
                    notified.await;
                }
                Acquire::Load(evicted) => break evicted,
            }
        };

        let reservation = LoadReservation {
            shared: self.shared.clone(),
            model,
            footprint,
            committed: false,
        };

        info!(model = %model, footprint, evicted = evicted.len(), "Loading model");
        let loader = registration.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            release_evicted(evicted);
            loader.load(model)
        })
        .await;

        let instance = match loaded {
            Ok(Ok(instance)) => instance,
            Ok(Err(source)) => {
                warn!(model = %model, error = %source, "Model load failed");
                return Err(PoolError::LoadFailed { model, source });
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Model loader panicked");
                return Err(PoolError::LoadPanicked(model));
            }
        };

        let instance: SharedInstance = Arc::new(AsyncMutex::new(instance));
        reservation.commit(instance.clone());
        info!(model = %model, "Model loaded");
        Ok(ModelLease::new(self.shared.clone(), model, instance))
    }

    fn try_acquire(&self, model: ModelKind, footprint: u64) -> Acquire {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.entries.get_mut(&model) {
            return match &entry.slot {
                Slot::Loading => Acquire::Wait,
                Slot::Ready(instance) => {
                    entry.pins += 1;
                    entry.last_used = tick;
                    state.stats.hits += 1;
                    Acquire::Hit(instance.clone())
                }
            };
        }

        // Evict nothing unless enough idle memory exists to fit the model.
        let idle: u64 = state
            .entries
            .values()
            .filter(|e| e.is_evictable())
            .map(|e| e.footprint)
            .sum();
        if state.used - idle + footprint > self.budget {
            return Acquire::Wait;
        }

        let mut evicted = Vec::new();
        while state.used + footprint > self.budget {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| e.is_evictable())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(m, _)| *m);
            let Some(victim) = victim else { break };
            if let Some(entry) = state.entries.remove(&victim) {
                state.used -= entry.footprint;
                state.stats.evictions += 1;
                info!(model = %victim, footprint = entry.footprint, "Evicting model");
                if let Slot::Ready(instance) = entry.slot {
                    evicted.push((victim, instance));
                }
            }
        }

        state.entries.insert(
            model,
            Entry {
                footprint,
                last_used: tick,
                pins: 1,
                slot: Slot::Loading,
            },
        );
        state.used += footprint;
        state.stats.misses += 1;
        Acquire::Load(evicted)
    }

    /// Current contents, least recently used first.
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.lock();
        let mut resident: Vec<_> = state
            .entries
            .iter()
            .map(|(model, entry)| {
                (
                    entry.last_used,
                    ResidentModel {
                        model: *model,
                        footprint: entry.footprint,
                        pinned: entry.pins > 0,
                        loading: matches!(entry.slot, Slot::Loading),
                    },
                )
            })
            .collect();
        resident.sort_by_key(|(last_used, _)| *last_used);

        PoolSnapshot {
            budget: self.budget,
            used: state.used,
            resident: resident.into_iter().map(|(_, r)| r).collect(),
            stats: state.stats,
        }
    }
}

fn release_evicted(evicted: Vec<(ModelKind, SharedInstance)>) {
    for (model, instance) in evicted {
        match Arc::try_unwrap(instance) {
            Ok(mutex) => mutex.into_inner().release(),
            // Unreachable while leases own every other clone; dropping still frees it.
            Err(_) => warn!(model = %model, "Evicted model still referenced"),
        }
    }
}

/// Budget held for a load in flight. Rolled back unless committed.
struct LoadReservation {
    shared: Arc<Shared>,
    model: ModelKind,
    footprint: u64,
    committed: bool,
}

impl LoadReservation {
    fn commit(mut self, instance: SharedInstance) {
        {
            let mut state = self.shared.lock();
            state.stats.loads += 1;
            if let Some(entry) = state.entries.get_mut(&self.model) {
                entry.slot = Slot::Ready(instance);
            }
        }
        self.committed = true;
        self.shared.changed.notify_waiters();
    }
}

impl Drop for LoadReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        {
            let mut state = self.shared.lock();
            if state.entries.remove(&self.model).is_some() {
                state.used -= self.footprint;
            }
            state.stats.load_failures += 1;
        }
        self.shared.changed.notify_waiters();
    }
}

/// A pinned reference to a resident model.
///
/// The entry cannot be evicted while the lease (or a guard obtained from it)
/// is alive.
pub struct ModelLease {
    // Dropped before `pin`, so an evictor that sees zero pins owns the last clone.
    instance: SharedInstance,
    pin: EntryPin,
}

impl ModelLease {
    fn new(shared: Arc<Shared>, model: ModelKind, instance: SharedInstance) -> Self {
        Self {
            instance,
            pin: EntryPin { shared, model },
        }
    }

    /// Wait for exclusive use of the instance.
    ///
    /// The returned guard keeps the lease, so it can be moved into a blocking
    /// task and the entry stays pinned until the guard is dropped.
    pub async fn lock(self) -> ModelGuard {
        let guard = self.instance.clone().lock_owned().await;
        ModelGuard {
            guard,
            _lease: self,
        }
    }
}

struct EntryPin {
    shared: Arc<Shared>,
    model: ModelKind,
}

impl Drop for EntryPin {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if let Some(entry) = state.entries.get_mut(&self.model) {
                entry.pins = entry.pins.saturating_sub(1);
            }
        }
        self.shared.changed.notify_waiters();
    }
}

/// Exclusive access to a leased instance.
pub struct ModelGuard {
    guard: OwnedMutexGuard<Box<dyn ModelInstance>>,
    _lease: ModelLease,
}

impl Deref for ModelGuard {
    type Target = dyn ModelInstance;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for ModelGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const A: ModelKind = ModelKind::FluxSchnell;
    const B: ModelKind = ModelKind::FluxDev;
    const C: ModelKind = ModelKind::Kokoro;

    struct Counted {
        released: Arc<AtomicUsize>,
    }

    impl ModelInstance for Counted {
        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        released: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    impl CountingLoader {
        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, _model: ModelKind) -> Result<Box<dyn ModelInstance>, BackendError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(BackendError::Execution("weights not found".to_string()));
            }
            Ok(Box::new(Counted {
                released: self.released.clone(),
            }))
        }
    }

    fn abc_pool(loader: Arc<CountingLoader>) -> ModelPool {
        ModelPool::new(10)
            .with_loader(A, 6, loader.clone())
            .with_loader(B, 6, loader.clone())
            .with_loader(C, 4, loader)
    }

    #[tokio::test]
    async fn test_lru_eviction_scenario() {
        let loader = Arc::new(CountingLoader::default());
        let pool = abc_pool(loader.clone());

        drop(pool.get(A).await.unwrap());
        assert_eq!(pool.snapshot().models(), vec![A]);

        drop(pool.get(B).await.unwrap());
        assert_eq!(pool.snapshot().models(), vec![B]);

        drop(pool.get(C).await.unwrap());
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.models(), vec![B, C]);
        assert_eq!(snapshot.used, 10);

        drop(pool.get(A).await.unwrap());
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.models(), vec![C, A]);
        assert_eq!(snapshot.used, 10);

        assert_eq!(loader.loads(), 4);
        assert_eq!(loader.released.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.stats.evictions, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_loads_once() {
        let loader = Arc::new(CountingLoader::default());
        let pool = abc_pool(loader.clone());

        drop(pool.get(C).await.unwrap());
        drop(pool.get(C).await.unwrap());

        assert_eq!(loader.loads(), 1);
        let stats = pool.snapshot().stats;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_hit_refreshes_recency() {
        let loader = Arc::new(CountingLoader::default());
        let pool = ModelPool::new(10)
            .with_loader(A, 4, loader.clone())
            .with_loader(B, 4, loader.clone())
            .with_loader(C, 4, loader);

        drop(pool.get(A).await.unwrap());
        drop(pool.get(B).await.unwrap());
        drop(pool.get(A).await.unwrap());
        drop(pool.get(C).await.unwrap());

        // B was least recently used, so it went instead of A.
        assert_eq!(pool.snapshot().models(), vec![A, C]);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_load() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let pool = Arc::new(abc_pool(loader.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get(A).await.map(drop) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(loader.loads(), 1);
        assert_eq!(pool.snapshot().used, 6);
    }

    #[tokio::test]
    async fn test_pinned_model_is_not_evicted() {
        let loader = Arc::new(CountingLoader::default());
        let pool = Arc::new(abc_pool(loader.clone()));

        let lease = pool.get(A).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(B).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.models(), vec![A]);
        assert!(snapshot.resident[0].pinned);

        drop(lease);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.snapshot().models(), vec![B]);
        assert_eq!(loader.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_keeps_entry_pinned() {
        let loader = Arc::new(CountingLoader::default());
        let pool = abc_pool(loader);

        let guard = pool.get(C).await.unwrap().lock().await;
        assert!(pool.snapshot().resident[0].pinned);
        drop(guard);
        assert!(!pool.snapshot().resident[0].pinned);
    }

    #[tokio::test]
    async fn test_budget_never_exceeded_under_contention() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let pool = Arc::new(abc_pool(loader));

        let handles: Vec<_> = (0..30)
            .map(|i| {
                let pool = pool.clone();
                let model = [A, B, C][i % 3];
                tokio::spawn(async move {
                    let guard = pool.get(model).await.unwrap().lock().await;
                    let snapshot = pool.snapshot();
                    assert!(snapshot.used <= snapshot.budget);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = pool.snapshot();
        assert!(snapshot.used <= 10);
        assert!(snapshot.resident.iter().all(|r| !r.pinned));
    }

    #[tokio::test]
    async fn test_failed_load_is_rolled_back() {
        let loader = Arc::new(CountingLoader {
            fail: true,
            ..Default::default()
        });
        let pool = abc_pool(loader.clone());

        let err = pool.get(A).await.err().unwrap();
        assert!(matches!(err, PoolError::LoadFailed { model: A, .. }));

        let snapshot = pool.snapshot();
        assert!(snapshot.resident.is_empty());
        assert_eq!(snapshot.used, 0);
        assert_eq!(snapshot.stats.load_failures, 1);

        // Not cached: the next get tries again.
        assert!(pool.get(A).await.is_err());
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn test_oversized_model_is_rejected() {
        let loader = Arc::new(CountingLoader::default());
        let pool = ModelPool::new(5).with_loader(A, 6, loader.clone());

        assert!(matches!(
            pool.get(A).await.err().unwrap(),
            PoolError::InsufficientBudget {
                required: 6,
                budget: 5,
                ..
            }
        ));
        assert_eq!(loader.loads(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_model_is_rejected() {
        let pool = ModelPool::new(10);
        assert!(matches!(
            pool.get(A).await.err().unwrap(),
            PoolError::LoaderNotFound(A)
        ));
    }

    #[test]
    fn test_validate() {
        let loader: Arc<dyn ModelLoader> = Arc::new(CountingLoader::default());
        let config = PoolConfig::default();
        ModelPool::from_config(&config, loader.clone())
            .validate()
            .unwrap();

        let tight = PoolConfig {
            budget: 8,
            ..PoolConfig::default()
        };
        assert!(matches!(
            ModelPool::from_config(&tight, loader.clone()).validate(),
            Err(PoolError::InsufficientBudget { .. })
        ));

        assert!(matches!(
            ModelPool::new(100).with_loader(A, 1, loader).validate(),
            Err(PoolError::LoaderNotFound(_))
        ));
    }
}
