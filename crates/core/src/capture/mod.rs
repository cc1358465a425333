mod synthetic;

use crate::audio::AudioSampler;
use crate::config::{AudioConstraints, VideoConstraints};
use crate::video::FrameSource;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use synthetic::{SyntheticCapture, SyntheticTrack};

const LOG_TARGET: &str = "capture";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constraints {
    Video(VideoConstraints),
    Audio(AudioConstraints),
}

impl Constraints {
    pub fn kind(&self) -> MediaKind {
        match self {
            Constraints::Video(_) => MediaKind::Video,
            Constraints::Audio(_) => MediaKind::Audio,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission to use the {0} device was denied")]
    PermissionDenied(MediaKind),

    #[error("no {0} device found")]
    DeviceNotFound(MediaKind),

    #[error("{0} track has ended")]
    TrackEnded(MediaKind),

    #[error("device capture failed: {0}")]
    Unknown(String),
}

/// One underlying device track (camera or microphone).
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn label(&self) -> String;
    fn stop(&self);
}

#[derive(Clone)]
pub enum StreamSource {
    Video(Arc<dyn FrameSource>),
    Audio(Arc<dyn AudioSampler>),
}

/// Exclusively owned media stream. Tracks are stopped exactly once, either by
/// an explicit [`StreamHandle::release`] or on drop.
pub struct StreamHandle {
    kind: MediaKind,
    tracks: Vec<Arc<dyn MediaTrack>>,
    source: StreamSource,
    released: AtomicBool,
}

impl StreamHandle {
    pub fn new_video(tracks: Vec<Arc<dyn MediaTrack>>, frames: Arc<dyn FrameSource>) -> Self {
        Self {
            kind: MediaKind::Video,
            tracks,
            source: StreamSource::Video(frames),
            released: AtomicBool::new(false),
        }
    }

    pub fn new_audio(tracks: Vec<Arc<dyn MediaTrack>>, sampler: Arc<dyn AudioSampler>) -> Self {
        Self {
            kind: MediaKind::Audio,
            tracks,
            source: StreamSource::Audio(sampler),
            released: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_labels(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.label()).collect()
    }

    pub fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        match &self.source {
            StreamSource::Video(frames) => Some(Arc::clone(frames)),
            StreamSource::Audio(_) => None,
        }
    }

    pub fn audio_sampler(&self) -> Option<Arc<dyn AudioSampler>> {
        match &self.source {
            StreamSource::Audio(sampler) => Some(Arc::clone(sampler)),
            StreamSource::Video(_) => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stop every track. Calls after the first are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in &self.tracks {
            tracing::debug!(target: LOG_TARGET, kind = %track.kind(), label = %track.label(), "stopping track");
            track.stop();
        }
        tracing::info!(target: LOG_TARGET, kind = %self.kind, tracks = self.tracks.len(), "stream released");
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Acquires camera and microphone streams. Acquisition may prompt the user
/// for permission; a denial is final until the user changes it.
pub trait DeviceCapture: Send + Sync {
    fn acquire(
        &self,
        constraints: Constraints,
    ) -> BoxFuture<'_, Result<StreamHandle, CaptureError>>;

    fn release(&self, handle: &StreamHandle) {
        handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConstraints, VideoConstraints};

    #[tokio::test]
    async fn release_stops_tracks_exactly_once() {
        let capture = SyntheticCapture::new(7);
        let handle = capture
            .acquire(Constraints::Video(VideoConstraints::default()))
            .await
            .expect("granted");
        assert_eq!(capture.live_tracks(), 1);

        capture.release(&handle);
        handle.release();
        drop(handle);

        assert_eq!(capture.live_tracks(), 0);
        assert_eq!(capture.track_stop_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_handle_releases() {
        let capture = SyntheticCapture::new(7);
        let handle = capture
            .acquire(Constraints::Audio(AudioConstraints::default()))
            .await
            .expect("granted");
        assert!(handle.audio_sampler().is_some());
        assert!(handle.frame_source().is_none());
        drop(handle);
        assert_eq!(capture.live_tracks(), 0);
    }

    #[tokio::test]
    async fn denied_and_missing_devices_are_distinguishable() {
        let capture = SyntheticCapture::new(7)
            .deny(MediaKind::Video)
            .without_device(MediaKind::Audio);

        let err = capture
            .acquire(Constraints::Video(VideoConstraints::default()))
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::PermissionDenied(MediaKind::Video));

        let err = capture
            .acquire(Constraints::Audio(AudioConstraints::default()))
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::DeviceNotFound(MediaKind::Audio));
        assert_eq!(capture.live_tracks(), 0);
    }

    #[tokio::test]
    async fn released_source_reports_track_ended() {
        let capture = SyntheticCapture::new(7);
        let handle = capture
            .acquire(Constraints::Video(VideoConstraints::default()))
            .await
            .expect("granted");
        let frames = handle.frame_source().expect("video source");
        assert!(frames.grab().await.is_ok());

        handle.release();
        assert_eq!(
            frames.grab().await.unwrap_err(),
            CaptureError::TrackEnded(MediaKind::Video)
        );
    }
}
