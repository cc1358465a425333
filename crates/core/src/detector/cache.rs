use crate::detector::{
    ComputeBackend, DetectorHandle, LandmarkModelFactory, ModelError, ModelOptions, ModelVariant,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const LOG_TARGET: &str = "detector::cache";

#[derive(Clone, Debug)]
pub enum DetectorState {
    Uninitialized,
    Initializing,
    Ready(Arc<DetectorHandle>),
    Failed(ModelError),
}

impl DetectorState {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorState::Uninitialized => "uninitialized",
            DetectorState::Initializing => "initializing",
            DetectorState::Ready(_) => "ready",
            DetectorState::Failed(_) => "failed",
        }
    }
}

/// Lazily builds and memoizes the landmark model for one session.
///
/// Construction runs at most once: concurrent [`DetectorCache::initialize`]
/// callers wait on the same attempt and share its handle. A failed attempt is
/// cached too and re-raised until [`DetectorCache::reinitialize`] is called.
pub struct DetectorCache {
    factory: Arc<dyn LandmarkModelFactory>,
    state: Mutex<DetectorState>,
    init_lock: tokio::sync::Mutex<()>,
}

impl DetectorCache {
    pub fn new(factory: Arc<dyn LandmarkModelFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(DetectorState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(target: LOG_TARGET, "detector state lock was poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn state(&self) -> DetectorState {
        self.lock_state().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_state(), DetectorState::Ready(_))
    }

    /// The ready handle, if construction has already succeeded.
    pub fn handle(&self) -> Option<Arc<DetectorHandle>> {
        match &*self.lock_state() {
            DetectorState::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    fn set_state(&self, next: DetectorState) {
        let mut guard = self.lock_state();
        tracing::debug!(target: LOG_TARGET, from = guard.name(), to = next.name(), "detector state transition");
        *guard = next;
    }

    fn settled(&self) -> Option<Result<Arc<DetectorHandle>, ModelError>> {
        match &*self.lock_state() {
            DetectorState::Ready(handle) => Some(Ok(Arc::clone(handle))),
            DetectorState::Failed(err) => Some(Err(err.clone())),
            DetectorState::Uninitialized | DetectorState::Initializing => None,
        }
    }

    pub async fn initialize(&self) -> Result<Arc<DetectorHandle>, ModelError> {
        if let Some(settled) = self.settled() {
            return settled;
        }

        let _guard = self.init_lock.lock().await;
        // Another caller may have finished while we waited.
        if let Some(settled) = self.settled() {
            return settled;
        }
        self.construct_locked().await
    }

    /// Discard the cached model (or cached failure) and build again.
    pub async fn reinitialize(&self) -> Result<Arc<DetectorHandle>, ModelError> {
        let _guard = self.init_lock.lock().await;
        tracing::info!(target: LOG_TARGET, "forcing landmark model re-initialization");
        self.set_state(DetectorState::Uninitialized);
        self.construct_locked().await
    }

    async fn construct_locked(&self) -> Result<Arc<DetectorHandle>, ModelError> {
        self.set_state(DetectorState::Initializing);
        let mut attempt = Attempt {
            cache: self,
            settled: false,
        };
        let started = Instant::now();

        let outcome = self.construct().await;
        attempt.settled = true;
        match outcome {
            Ok(handle) => {
                tracing::info!(
                    target: LOG_TARGET,
                    backend = %handle.backend(),
                    variant = %handle.variant(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "landmark model ready"
                );
                self.set_state(DetectorState::Ready(Arc::clone(&handle)));
                Ok(handle)
            }
            Err(err) => {
                tracing::error!(target: LOG_TARGET, error = %err, "landmark model unavailable");
                self.set_state(DetectorState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    async fn construct(&self) -> Result<Arc<DetectorHandle>, ModelError> {
        let backend = self.prepare_backend().await?;

        let full = match self
            .factory
            .build(ModelOptions::for_variant(ModelVariant::Full))
            .await
        {
            Ok(detector) => {
                return Ok(Arc::new(DetectorHandle::new(
                    detector,
                    backend,
                    ModelVariant::Full,
                )))
            }
            Err(err) => err,
        };
        tracing::warn!(
            target: LOG_TARGET,
            error = %full,
            "full landmark model failed; retrying without refined landmarks"
        );

        match self
            .factory
            .build(ModelOptions::for_variant(ModelVariant::Reduced))
            .await
        {
            Ok(detector) => Ok(Arc::new(DetectorHandle::new(
                detector,
                backend,
                ModelVariant::Reduced,
            ))),
            Err(reduced) => Err(ModelError::Unavailable {
                full: full.to_string(),
                reduced: reduced.to_string(),
            }),
        }
    }

    async fn prepare_backend(&self) -> Result<ComputeBackend, ModelError> {
        let gpu = match self.factory.prepare_backend(ComputeBackend::Gpu).await {
            Ok(()) => return Ok(ComputeBackend::Gpu),
            Err(err) => err,
        };
        tracing::warn!(target: LOG_TARGET, error = %gpu, "gpu backend unavailable; falling back to cpu");

        match self.factory.prepare_backend(ComputeBackend::Cpu).await {
            Ok(()) => Ok(ComputeBackend::Cpu),
            Err(cpu) => Err(ModelError::NoBackend {
                gpu: gpu.to_string(),
                cpu: cpu.to_string(),
            }),
        }
    }
}

/// Resets `Initializing` to `Uninitialized` when the initializing future is
/// dropped before construction settles.
struct Attempt<'a> {
    cache: &'a DetectorCache,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(target: LOG_TARGET, "landmark model construction abandoned");
        let mut state = self.cache.lock_state();
        if matches!(*state, DetectorState::Initializing) {
            *state = DetectorState::Uninitialized;
        }
    }
}
