use crate::audio::AudioAnalysisResult;
use crate::capture::{CaptureError, MediaKind, StreamHandle};
use crate::detector::ModelError;
use crate::emotion::ShapeError;
use crate::telemetry::{PerformanceMetrics, PerformanceTelemetry};
use crate::video::VideoAnalysisResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const LOG_TARGET: &str = "scheduler";
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A single bad frame or sample. Always recovered inside the tick.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("transient frame failure: {0}")]
    TransientFrameFailure(String),
}

impl From<CaptureError> for ExtractError {
    fn from(err: CaptureError) -> Self {
        ExtractError::TransientFrameFailure(err.to_string())
    }
}

impl From<ModelError> for ExtractError {
    fn from(err: ModelError) -> Self {
        ExtractError::TransientFrameFailure(err.to_string())
    }
}

impl From<ShapeError> for ExtractError {
    fn from(err: ShapeError) -> Self {
        ExtractError::TransientFrameFailure(format!("malformed result: {err}"))
    }
}

/// Result records checked at the boundary before they reach the consumer.
pub trait AnalysisOutput: Clone + Send + Sync + 'static {
    fn validate(&self) -> Result<(), ShapeError>;
}

impl AnalysisOutput for VideoAnalysisResult {
    fn validate(&self) -> Result<(), ShapeError> {
        VideoAnalysisResult::validate(self)
    }
}

impl AnalysisOutput for AudioAnalysisResult {
    fn validate(&self) -> Result<(), ShapeError> {
        AudioAnalysisResult::validate(self)
    }
}

/// One extraction per tick. Implementations recover their own errors; a
/// panic is caught by the scheduler and replaced with [`Extractor::fallback`].
pub trait Extractor: Send + Sync + 'static {
    type Output: AnalysisOutput;

    fn extract(&self) -> BoxFuture<'_, Self::Output>;

    fn fallback(&self) -> Self::Output;
}

pub type ResultCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Polling,
    Stopped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("analysis is already running")]
    AlreadyRunning,
    #[error("scheduler was stopped; create a new one to restart")]
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub ticks_fired: u64,
    pub ticks_skipped: u64,
    pub extractions: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    ticks_fired: AtomicU64,
    ticks_skipped: AtomicU64,
    extractions: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            ticks_fired: self.ticks_fired.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            extractions: self.extractions.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

struct Shared<T> {
    live: AtomicBool,
    in_flight: AtomicBool,
    /// Held across the liveness check and the whole delivery of one result,
    /// and by `stop()` while it clears `live` and `last`.
    delivery: Mutex<()>,
    last: Mutex<Option<T>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T> Shared<T> {
    fn delivery(&self) -> MutexGuard<'_, ()> {
        lock(&self.delivery)
    }

    fn last(&self) -> MutexGuard<'_, Option<T>> {
        lock(&self.last)
    }
}

/// Clears the in-flight flag however the extraction task ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Tick<E: Extractor> {
    kind: MediaKind,
    extractor: Arc<E>,
    shared: Arc<Shared<E::Output>>,
    telemetry: Arc<PerformanceTelemetry>,
    on_result: ResultCallback<E::Output>,
}

impl<E: Extractor> Clone for Tick<E> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            extractor: Arc::clone(&self.extractor),
            shared: Arc::clone(&self.shared),
            telemetry: Arc::clone(&self.telemetry),
            on_result: Arc::clone(&self.on_result),
        }
    }
}

/// Periodic polling loop for one modality.
///
/// A tick that finds the previous extraction still running is dropped, never
/// queued, so at most one extraction is in flight and results arrive in tick
/// order. After [`AnalysisScheduler::stop`] nothing more is delivered.
pub struct AnalysisScheduler<E: Extractor> {
    kind: MediaKind,
    period: Duration,
    extractor: Arc<E>,
    stream: Option<StreamHandle>,
    telemetry: Arc<PerformanceTelemetry>,
    shared: Arc<Shared<E::Output>>,
    timer: Option<JoinHandle<()>>,
    state: SchedulerState,
}

impl<E: Extractor> AnalysisScheduler<E> {
    pub fn new(
        kind: MediaKind,
        period: Duration,
        extractor: E,
        telemetry: Arc<PerformanceTelemetry>,
    ) -> Self {
        Self {
            kind,
            period: period.max(MIN_PERIOD),
            extractor: Arc::new(extractor),
            stream: None,
            telemetry,
            shared: Arc::new(Shared {
                live: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                delivery: Mutex::new(()),
                last: Mutex::new(None),
                counters: Counters::default(),
            }),
            timer: None,
            state: SchedulerState::Idle,
        }
    }

    /// Hand the device stream to the scheduler; it is released on stop.
    pub fn with_stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<E::Output> {
        self.shared.last().clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.telemetry.snapshot()
    }

    /// Must be called from within a tokio runtime. The first tick fires one
    /// period after this call.
    ///
    /// `on_result` runs on a runtime worker while delivery is locked; it must
    /// not call [`AnalysisScheduler::stop`] on the same scheduler.
    pub fn start<F>(&mut self, on_result: F) -> Result<(), SchedulerError>
    where
        F: Fn(E::Output) + Send + Sync + 'static,
    {
        match self.state {
            SchedulerState::Polling => return Err(SchedulerError::AlreadyRunning),
            SchedulerState::Stopped => return Err(SchedulerError::Stopped),
            SchedulerState::Idle => {}
        }

        self.shared.live.store(true, Ordering::Release);
        let tick = Tick {
            kind: self.kind,
            extractor: Arc::clone(&self.extractor),
            shared: Arc::clone(&self.shared),
            telemetry: Arc::clone(&self.telemetry),
            on_result: Arc::new(on_result),
        };
        self.timer = Some(tokio::spawn(run_timer(tick, self.period)));
        self.state = SchedulerState::Polling;

        tracing::info!(
            target: LOG_TARGET,
            kind = %self.kind,
            period_ms = self.period.as_millis() as u64,
            "analysis polling started"
        );
        Ok(())
    }

    /// Cancel the timer, release the stream and drop the last result. An
    /// extraction already running may finish but its result is discarded.
    pub fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        {
            // Waits for a delivery in progress; none can start afterwards.
            let _delivery = self.shared.delivery();
            self.shared.live.store(false, Ordering::Release);
            self.shared.last().take();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.release();
        }

        let was = self.state;
        self.state = SchedulerState::Stopped;
        if was == SchedulerState::Polling {
            let stats = self.stats();
            tracing::info!(
                target: LOG_TARGET,
                kind = %self.kind,
                ticks_fired = stats.ticks_fired,
                ticks_skipped = stats.ticks_skipped,
                delivered = stats.delivered,
                "analysis polling stopped"
            );
        }
    }
}

impl<E: Extractor> Drop for AnalysisScheduler<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer<E: Extractor>(tick: Tick<E>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !tick.shared.live.load(Ordering::Acquire) {
            break;
        }
        let counters = &tick.shared.counters;
        counters.ticks_fired.fetch_add(1, Ordering::Relaxed);

        if tick.shared.in_flight.swap(true, Ordering::AcqRel) {
            counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(target: LOG_TARGET, kind = %tick.kind, "previous extraction still running; tick dropped");
            continue;
        }
        tokio::spawn(run_extraction(tick.clone()));
    }
}

async fn run_extraction<E: Extractor>(tick: Tick<E>) {
    let _in_flight = InFlight(&tick.shared.in_flight);
    let started = Instant::now();

    let output = match AssertUnwindSafe(tick.extractor.extract())
        .catch_unwind()
        .await
    {
        Ok(output) => output,
        Err(panic) => {
            let err = ExtractError::TransientFrameFailure(format!(
                "extractor panicked: {}",
                panic_message(panic.as_ref())
            ));
            tracing::warn!(target: LOG_TARGET, kind = %tick.kind, error = %err, "using fallback result");
            tick.extractor.fallback()
        }
    };
    let elapsed = started.elapsed();
    let counters = &tick.shared.counters;
    counters.extractions.fetch_add(1, Ordering::Relaxed);

    let output = match output.validate() {
        Ok(()) => output,
        Err(err) => {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: LOG_TARGET, kind = %tick.kind, error = %err, "extractor produced a malformed result; using fallback");
            let fallback = tick.extractor.fallback();
            if let Err(err) = fallback.validate() {
                tracing::error!(target: LOG_TARGET, kind = %tick.kind, error = %err, "fallback result is malformed; tick skipped");
                return;
            }
            fallback
        }
    };

    let _delivery = tick.shared.delivery();
    if !tick.shared.live.load(Ordering::Acquire) {
        counters.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: LOG_TARGET, kind = %tick.kind, "extraction finished after stop; result discarded");
        return;
    }

    *tick.shared.last() = Some(output.clone());
    (tick.on_result)(output);
    counters.delivered.fetch_add(1, Ordering::Relaxed);
    tick.telemetry.record(elapsed);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
