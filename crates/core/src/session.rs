use crate::audio::{
    AudioAnalysisResult, AudioAnalyzer, AudioFeatureExtractor, AudioScoring,
    HeuristicAudioScoring,
};
use crate::capture::{CaptureError, Constraints, DeviceCapture, MediaKind, StreamHandle};
use crate::config::AnalysisConfig;
use crate::detector::{DetectorCache, ModelError};
use crate::scheduler::{AnalysisScheduler, Extractor, SchedulerError, SchedulerStats};
use crate::telemetry::{LatencySummary, PerformanceMetrics, PerformanceTelemetry};
use crate::video::{VideoAnalysisResult, VideoAnalyzer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const LOG_TARGET: &str = "session";

pub type Modality = MediaKind;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("{0} permission denied")]
    PermissionDenied(Modality),
    #[error("no {0} device found")]
    DeviceNotFound(Modality),
    #[error("landmark model unavailable: {0}")]
    ModelUnavailable(#[source] ModelError),
    #[error("{0} analysis is already running")]
    AlreadyRunning(Modality),
    #[error("{0} analysis was stopped before it finished starting")]
    Cancelled(Modality),
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<CaptureError> for StartError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(kind) => StartError::PermissionDenied(kind),
            CaptureError::DeviceNotFound(kind) => StartError::DeviceNotFound(kind),
            other => StartError::Device(other.to_string()),
        }
    }
}

enum Slot<E: Extractor> {
    Idle,
    Starting(u64),
    Running(AnalysisScheduler<E>),
}

impl<E: Extractor> Slot<E> {
    fn is_pending(&self, generation: u64) -> bool {
        matches!(self, Slot::Starting(g) if *g == generation)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks a slot as starting and puts it back to idle if setup fails or the
/// start future is dropped.
struct PendingStart<'a, E: Extractor> {
    slot: &'a Mutex<Slot<E>>,
    kind: Modality,
    generation: u64,
    armed: bool,
}

impl<'a, E: Extractor> PendingStart<'a, E> {
    fn claim(
        slot: &'a Mutex<Slot<E>>,
        kind: Modality,
        generation: u64,
    ) -> Result<Self, StartError> {
        let mut guard = lock(slot);
        if !matches!(*guard, Slot::Idle) {
            return Err(StartError::AlreadyRunning(kind));
        }
        *guard = Slot::Starting(generation);
        Ok(Self {
            slot,
            kind,
            generation,
            armed: true,
        })
    }

    fn ensure_pending(&self) -> Result<(), StartError> {
        if lock(self.slot).is_pending(self.generation) {
            Ok(())
        } else {
            Err(StartError::Cancelled(self.kind))
        }
    }

    /// Install the running scheduler unless stop() raced the setup, in which
    /// case the scheduler (and its stream) is stopped here.
    fn complete(mut self, mut scheduler: AnalysisScheduler<E>) -> Result<(), StartError> {
        let mut guard = lock(self.slot);
        if !guard.is_pending(self.generation) {
            drop(guard);
            scheduler.stop();
            return Err(StartError::Cancelled(self.kind));
        }
        *guard = Slot::Running(scheduler);
        self.armed = false;
        Ok(())
    }
}

impl<E: Extractor> Drop for PendingStart<'_, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = lock(self.slot);
        if guard.is_pending(self.generation) {
            *guard = Slot::Idle;
        }
    }
}

/// Owns everything one analysis client needs: the device capture, the shared
/// landmark model cache, one scheduler per modality, and latency telemetry.
///
/// Video and audio run independently; either may be started, stopped and
/// restarted while the other keeps running.
pub struct AnalysisSession {
    config: AnalysisConfig,
    capture: Arc<dyn DeviceCapture>,
    detector: Arc<DetectorCache>,
    scoring: Arc<dyn AudioScoring>,
    video: Mutex<Slot<VideoAnalyzer>>,
    audio: Mutex<Slot<AudioAnalyzer>>,
    video_telemetry: Arc<PerformanceTelemetry>,
    audio_telemetry: Arc<PerformanceTelemetry>,
    generation: AtomicU64,
}

impl AnalysisSession {
    pub fn new(
        config: AnalysisConfig,
        capture: Arc<dyn DeviceCapture>,
        detector: Arc<DetectorCache>,
    ) -> Self {
        Self {
            config,
            capture,
            detector,
            scoring: Arc::new(HeuristicAudioScoring),
            video: Mutex::new(Slot::Idle),
            audio: Mutex::new(Slot::Idle),
            video_telemetry: Arc::new(PerformanceTelemetry::new()),
            audio_telemetry: Arc::new(PerformanceTelemetry::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_audio_scoring(mut self, scoring: Arc<dyn AudioScoring>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<DetectorCache> {
        &self.detector
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_ready()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn acquire(&self, constraints: Constraints) -> Result<StreamHandle, StartError> {
        let kind = constraints.kind();
        let stream = self.capture.acquire(constraints).await.map_err(|err| {
            tracing::warn!(target: LOG_TARGET, %kind, error = %err, "device acquisition failed");
            StartError::from(err)
        })?;
        tracing::info!(target: LOG_TARGET, %kind, tracks = ?stream.track_labels(), "device acquired");
        Ok(stream)
    }

    /// Initialise the landmark model (once per cache), open the camera and
    /// begin polling. Results are delivered to `on_result` in tick order;
    /// the callback must not stop this session's video analysis itself.
    pub async fn start_video_analysis<F>(&self, on_result: F) -> Result<(), StartError>
    where
        F: Fn(VideoAnalysisResult) + Send + Sync + 'static,
    {
        let kind = MediaKind::Video;
        let pending = PendingStart::claim(&self.video, kind, self.next_generation())?;

        let detector = self
            .detector
            .initialize()
            .await
            .map_err(StartError::ModelUnavailable)?;
        pending.ensure_pending()?;

        let stream = self
            .acquire(Constraints::Video(self.config.video.clone()))
            .await?;
        let Some(frames) = stream.frame_source() else {
            stream.release();
            return Err(StartError::Device("stream has no video track".to_owned()));
        };

        let mut scheduler = AnalysisScheduler::new(
            kind,
            self.config.video_interval.duration(),
            VideoAnalyzer::new(frames, detector),
            Arc::clone(&self.video_telemetry),
        )
        .with_stream(stream);
        scheduler.start(on_result)?;
        pending.complete(scheduler)
    }

    pub fn stop_video_analysis(&self) {
        stop_slot(&self.video, MediaKind::Video);
    }

    /// Open the microphone and begin polling.
    pub async fn start_audio_analysis<F>(&self, on_result: F) -> Result<(), StartError>
    where
        F: Fn(AudioAnalysisResult) + Send + Sync + 'static,
    {
        let kind = MediaKind::Audio;
        let pending = PendingStart::claim(&self.audio, kind, self.next_generation())?;

        let stream = self
            .acquire(Constraints::Audio(self.config.audio.clone()))
            .await?;
        let Some(sampler) = stream.audio_sampler() else {
            stream.release();
            return Err(StartError::Device("stream has no audio track".to_owned()));
        };

        let extractor = AudioFeatureExtractor::new(Arc::clone(&self.scoring));
        let mut scheduler = AnalysisScheduler::new(
            kind,
            self.config.audio_interval.duration(),
            AudioAnalyzer::new(sampler, extractor),
            Arc::clone(&self.audio_telemetry),
        )
        .with_stream(stream);
        scheduler.start(on_result)?;
        pending.complete(scheduler)
    }

    pub fn stop_audio_analysis(&self) {
        stop_slot(&self.audio, MediaKind::Audio);
    }

    pub fn stop_all(&self) {
        self.stop_video_analysis();
        self.stop_audio_analysis();
    }

    pub fn is_running(&self, kind: Modality) -> bool {
        match kind {
            MediaKind::Video => matches!(*lock(&self.video), Slot::Running(_)),
            MediaKind::Audio => matches!(*lock(&self.audio), Slot::Running(_)),
        }
    }

    /// Count and mean latency of delivered results. Survives stop and restart.
    pub fn performance_metrics(&self, kind: Modality) -> PerformanceMetrics {
        self.telemetry(kind).snapshot()
    }

    pub fn latency_summary(&self, kind: Modality) -> LatencySummary {
        self.telemetry(kind).summary()
    }

    fn telemetry(&self, kind: Modality) -> &PerformanceTelemetry {
        match kind {
            MediaKind::Video => &self.video_telemetry,
            MediaKind::Audio => &self.audio_telemetry,
        }
    }

    pub fn last_video_result(&self) -> Option<VideoAnalysisResult> {
        match &*lock(&self.video) {
            Slot::Running(s) => s.last_result(),
            _ => None,
        }
    }

    pub fn last_audio_result(&self) -> Option<AudioAnalysisResult> {
        match &*lock(&self.audio) {
            Slot::Running(s) => s.last_result(),
            _ => None,
        }
    }

    /// Counters of the running scheduler, if any.
    pub fn scheduler_stats(&self, kind: Modality) -> Option<SchedulerStats> {
        match kind {
            MediaKind::Video => stats_of(&self.video),
            MediaKind::Audio => stats_of(&self.audio),
        }
    }
}

impl Drop for AnalysisSession {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn stats_of<E: Extractor>(slot: &Mutex<Slot<E>>) -> Option<SchedulerStats> {
    match &*lock(slot) {
        Slot::Running(s) => Some(s.stats()),
        _ => None,
    }
}

fn stop_slot<E: Extractor>(slot: &Mutex<Slot<E>>, kind: Modality) {
    let previous = std::mem::replace(&mut *lock(slot), Slot::Idle);
    match previous {
        Slot::Running(mut scheduler) => scheduler.stop(),
        Slot::Starting(_) => {
            tracing::info!(target: LOG_TARGET, %kind, "stop requested while starting; setup will be abandoned");
        }
        Slot::Idle => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCapture;
    use crate::detector::{DetectorState, SyntheticModelFactory};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn session_with(
        capture: &Arc<SyntheticCapture>,
        factory: SyntheticModelFactory,
    ) -> Arc<AnalysisSession> {
        let capture: Arc<dyn DeviceCapture> = Arc::clone(capture) as Arc<dyn DeviceCapture>;
        let detector = Arc::new(DetectorCache::new(Arc::new(factory)));
        Arc::new(AnalysisSession::new(AnalysisConfig::default(), capture, detector))
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let n = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&n), n)
    }

    #[tokio::test(start_paused = true)]
    async fn video_and_audio_run_independently_and_release_devices() {
        let capture = Arc::new(SyntheticCapture::new(3));
        let session = session_with(&capture, SyntheticModelFactory::new(3));
        assert!(!session.is_ready());

        let (video_seen, video_sink) = counter();
        let (audio_seen, audio_sink) = counter();
        session
            .start_video_analysis(move |r| {
                assert!(r.validate().is_ok());
                video_sink.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("video starts");
        session
            .start_audio_analysis(move |r| {
                assert!(r.validate().is_ok());
                audio_sink.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("audio starts");
        assert!(session.is_ready());
        assert_eq!(capture.live_tracks(), 2);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(session.last_video_result().is_some());
        assert!(session.last_audio_result().is_some());

        session.stop_audio_analysis();
        assert_eq!(capture.live_tracks(), 1);
        assert!(session.is_running(MediaKind::Video));
        assert!(session.last_audio_result().is_none());

        session.stop_video_analysis();
        session.stop_video_analysis();
        assert_eq!(capture.live_tracks(), 0);

        let video = video_seen.load(Ordering::SeqCst);
        let audio = audio_seen.load(Ordering::SeqCst);
        assert!(video >= 3, "video results {video}");
        assert!(audio >= 5, "audio results {audio}");
        assert_eq!(session.performance_metrics(MediaKind::Video).count, video as u64);
        assert_eq!(session.performance_metrics(MediaKind::Audio).count, audio as u64);
        assert!(session.scheduler_stats(MediaKind::Video).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_reports_already_running() {
        let capture = Arc::new(SyntheticCapture::new(4));
        let session = session_with(&capture, SyntheticModelFactory::new(4));
        session.start_audio_analysis(|_| {}).await.expect("starts");

        let err = session.start_audio_analysis(|_| {}).await;
        assert_eq!(err, Err(StartError::AlreadyRunning(MediaKind::Audio)));
        assert_eq!(capture.acquired_streams(), 1);

        session.stop_audio_analysis();
        session.start_audio_analysis(|_| {}).await.expect("restarts");
        assert_eq!(capture.live_tracks(), 1);
    }

    #[tokio::test]
    async fn camera_denial_is_reported_and_slot_is_freed() {
        let capture = Arc::new(SyntheticCapture::new(5).deny(MediaKind::Video));
        let session = session_with(&capture, SyntheticModelFactory::new(5));

        for _ in 0..2 {
            let err = session.start_video_analysis(|_| {}).await;
            assert_eq!(err, Err(StartError::PermissionDenied(MediaKind::Video)));
        }
        assert!(!session.is_running(MediaKind::Video));
        assert_eq!(capture.live_tracks(), 0);

        session.start_audio_analysis(|_| {}).await.expect("microphone still allowed");
    }

    #[tokio::test]
    async fn missing_microphone_is_distinguished_from_denial() {
        let capture = Arc::new(SyntheticCapture::new(6).without_device(MediaKind::Audio));
        let session = session_with(&capture, SyntheticModelFactory::new(6));
        let err = session.start_audio_analysis(|_| {}).await;
        assert_eq!(err, Err(StartError::DeviceNotFound(MediaKind::Audio)));
    }

    #[tokio::test]
    async fn model_failure_surfaces_before_camera_is_opened() {
        let capture = Arc::new(SyntheticCapture::new(7));
        let session = session_with(&capture, SyntheticModelFactory::new(7).failing_all());

        let err = session.start_video_analysis(|_| {}).await;
        assert!(matches!(err, Err(StartError::ModelUnavailable(_))), "{err:?}");
        assert!(!session.is_ready());
        assert!(matches!(session.detector().state(), DetectorState::Failed(_)));
        assert_eq!(capture.acquired_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_model_setup_cancels_start() {
        let capture = Arc::new(SyntheticCapture::new(8));
        let factory = SyntheticModelFactory::new(8).with_build_delay(Duration::from_secs(1));
        let session = session_with(&capture, factory);
        let (seen, sink) = counter();

        let starter = Arc::clone(&session);
        let start = tokio::spawn(async move {
            starter
                .start_video_analysis(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop_video_analysis();

        let result = start.await.expect("join");
        assert_eq!(result, Err(StartError::Cancelled(MediaKind::Video)));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(capture.acquired_streams(), 0);
        assert_eq!(capture.live_tracks(), 0);
        assert!(session.is_ready());

        session.start_video_analysis(|_| {}).await.expect("starts after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_accumulate_across_restarts() {
        let capture = Arc::new(SyntheticCapture::new(9));
        let session = session_with(&capture, SyntheticModelFactory::new(9));

        session.start_audio_analysis(|_| {}).await.expect("starts");
        tokio::time::sleep(Duration::from_millis(650)).await;
        session.stop_audio_analysis();
        let first = session.performance_metrics(MediaKind::Audio).count;
        assert_eq!(first, 2);

        session.start_audio_analysis(|_| {}).await.expect("restarts");
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            session.scheduler_stats(MediaKind::Audio).map(|s| s.delivered),
            Some(1)
        );
        session.stop_audio_analysis();
        assert_eq!(session.performance_metrics(MediaKind::Audio).count, 3);
        assert_eq!(session.performance_metrics(MediaKind::Video).count, 0);
    }
}
