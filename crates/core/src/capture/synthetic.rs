use crate::audio::{AudioSample, AudioSampler};
use crate::capture::{
    CaptureError, Constraints, DeviceCapture, MediaKind, MediaTrack, StreamHandle,
};
use crate::config::{AudioConstraints, FftSize};
use crate::video::{Frame, FrameSource};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SYNTHETIC_SAMPLE_RATE_HZ: u32 = 48_000;
const PROCESSED_NOISE: f32 = 0.05;
const RAW_NOISE: f32 = 0.2;
// 5 ms at 48 kHz.
const ECHO_DELAY_SAMPLES: usize = 240;
const ECHO_GAIN: f32 = 0.4;
// Byte mapping of the magnitude spectrum, in dBFS.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Availability {
    Granted,
    Denied,
    Missing,
}

/// Device capture that fabricates a camera and a microphone. Used by the demo
/// binary and by tests that need to observe track lifecycles.
#[derive(Clone)]
pub struct SyntheticCapture {
    video: Availability,
    audio: Availability,
    seed: u64,
    live_tracks: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
}

impl SyntheticCapture {
    pub fn new(seed: u64) -> Self {
        Self {
            video: Availability::Granted,
            audio: Availability::Granted,
            seed,
            live_tracks: Arc::new(AtomicUsize::new(0)),
            stop_calls: Arc::new(AtomicUsize::new(0)),
            acquired: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn deny(mut self, kind: MediaKind) -> Self {
        *self.availability_mut(kind) = Availability::Denied;
        self
    }

    pub fn without_device(mut self, kind: MediaKind) -> Self {
        *self.availability_mut(kind) = Availability::Missing;
        self
    }

    fn availability_mut(&mut self, kind: MediaKind) -> &mut Availability {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    /// Tracks acquired and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn track_stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn acquired_streams(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    fn new_track(&self, kind: MediaKind, label: String) -> Arc<SyntheticTrack> {
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        Arc::new(SyntheticTrack {
            kind,
            label,
            stopped: AtomicBool::new(false),
            live_tracks: Arc::clone(&self.live_tracks),
            stop_calls: Arc::clone(&self.stop_calls),
        })
    }
}

impl DeviceCapture for SyntheticCapture {
    fn acquire(
        &self,
        constraints: Constraints,
    ) -> BoxFuture<'_, Result<StreamHandle, CaptureError>> {
        async move {
            let kind = constraints.kind();
            let availability = match kind {
                MediaKind::Video => self.video,
                MediaKind::Audio => self.audio,
            };
            match availability {
                Availability::Denied => return Err(CaptureError::PermissionDenied(kind)),
                Availability::Missing => return Err(CaptureError::DeviceNotFound(kind)),
                Availability::Granted => {}
            }

            self.acquired.fetch_add(1, Ordering::SeqCst);
            let label = match &constraints {
                Constraints::Video(video) => format!("synthetic camera ({})", video.facing),
                Constraints::Audio(_) => "synthetic microphone".to_owned(),
            };
            let track = self.new_track(kind, label);
            let dyn_track: Arc<dyn MediaTrack> = track.clone();
            let tracks = vec![dyn_track];
            let handle = match constraints {
                Constraints::Video(video) => StreamHandle::new_video(
                    tracks,
                    Arc::new(SyntheticFrameSource {
                        width: video.width,
                        height: video.height,
                        sequence: AtomicU64::new(0),
                        track,
                    }),
                ),
                Constraints::Audio(audio) => StreamHandle::new_audio(
                    tracks,
                    Arc::new(SyntheticAudioSampler::new(&audio, self.seed, track)),
                ),
            };
            Ok(handle)
        }
        .boxed()
    }
}

pub struct SyntheticTrack {
    kind: MediaKind,
    label: String,
    stopped: AtomicBool,
    live_tracks: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
}

impl SyntheticTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for SyntheticTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct SyntheticFrameSource {
    width: u32,
    height: u32,
    sequence: AtomicU64,
    track: Arc<SyntheticTrack>,
}

impl FrameSource for SyntheticFrameSource {
    fn grab(&self) -> BoxFuture<'_, Result<Frame, CaptureError>> {
        async move {
            if self.track.is_stopped() {
                return Err(CaptureError::TrackEnded(MediaKind::Video));
            }
            Ok(Frame {
                width: self.width,
                height: self.height,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                pixels: Bytes::new(),
            })
        }
        .boxed()
    }
}

struct SyntheticAudioSampler {
    fft_size: FftSize,
    noise: f32,
    echo: bool,
    sequence: AtomicU64,
    rng: Mutex<StdRng>,
    track: Arc<SyntheticTrack>,
}

impl SyntheticAudioSampler {
    /// Disabled processing constraints leave more noise and a room echo in the
    /// signal.
    fn new(constraints: &AudioConstraints, seed: u64, track: Arc<SyntheticTrack>) -> Self {
        Self {
            fft_size: constraints.fft_size,
            noise: if constraints.noise_suppression {
                PROCESSED_NOISE
            } else {
                RAW_NOISE
            },
            echo: !constraints.echo_cancellation,
            sequence: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            track,
        }
    }

    /// A voiced tone whose pitch and loudness drift from window to window.
    fn waveform(&self, sequence: u64) -> Vec<f32> {
        let n = self.fft_size.get() as usize;
        let phase = sequence as f32 * 0.35;
        let fundamental = 170.0 + 70.0 * phase.sin();
        let amplitude = 0.45 + 0.3 * (phase * 0.7).cos();
        let sr = SYNTHETIC_SAMPLE_RATE_HZ as f32;

        let mut rng = match self.rng.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let voiced = |i: usize| {
            let t = i as f32 / sr;
            (2.0 * PI * fundamental * t).sin()
                + 0.35 * (2.0 * PI * 2.0 * fundamental * t).sin()
                + 0.15 * (2.0 * PI * 3.0 * fundamental * t).sin()
        };
        (0..n)
            .map(|i| {
                let mut s = voiced(i);
                if self.echo && i >= ECHO_DELAY_SAMPLES {
                    s += ECHO_GAIN * voiced(i - ECHO_DELAY_SAMPLES);
                }
                let noise: f32 = rng.random_range(-self.noise..self.noise);
                (amplitude * s / 1.5 + noise).clamp(-1.0, 1.0)
            })
            .collect()
    }
}

impl AudioSampler for SyntheticAudioSampler {
    fn sample_rate(&self) -> u32 {
        SYNTHETIC_SAMPLE_RATE_HZ
    }

    fn sample(&self) -> BoxFuture<'_, Result<AudioSample, CaptureError>> {
        async move {
            if self.track.is_stopped() {
                return Err(CaptureError::TrackEnded(MediaKind::Audio));
            }
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let signal = self.waveform(sequence);
            let bins = self.fft_size.bin_count();

            let frequency = byte_spectrum(&signal, bins);
            let time_domain = signal
                .iter()
                .take(bins)
                .map(|&s| (128.0 + s * 127.0).round().clamp(0.0, 255.0) as u8)
                .collect();

            Ok(AudioSample {
                frequency,
                time_domain,
                sample_rate: SYNTHETIC_SAMPLE_RATE_HZ,
            })
        }
        .boxed()
    }
}

/// Blackman-windowed DFT magnitude, mapped to bytes over
/// `[MIN_DECIBELS, MAX_DECIBELS]`.
fn byte_spectrum(signal: &[f32], bins: usize) -> Vec<u8> {
    let n = signal.len();
    if n == 0 {
        return vec![0; bins];
    }
    let windowed: Vec<f32> = signal
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let x = i as f32 / n as f32;
            let w = 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
            s * w
        })
        .collect();

    let range = MAX_DECIBELS - MIN_DECIBELS;
    (0..bins)
        .map(|k| {
            let step = -2.0 * PI * k as f32 / n as f32;
            let (step_sin, step_cos) = step.sin_cos();
            let (mut w_re, mut w_im) = (1.0f32, 0.0f32);
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for &s in &windowed {
                re += s * w_re;
                im += s * w_im;
                let next_re = w_re * step_cos - w_im * step_sin;
                w_im = w_re * step_sin + w_im * step_cos;
                w_re = next_re;
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            let db = if magnitude > 0.0 {
                20.0 * magnitude.log10()
            } else {
                MIN_DECIBELS
            };
            (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FacingMode, VideoConstraints};

    #[test]
    fn silent_signal_has_empty_spectrum() {
        let spectrum = byte_spectrum(&[0.0; 256], 128);
        assert_eq!(spectrum.len(), 128);
        assert!(spectrum.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_peaks_near_its_bin() {
        let n = 1024;
        let sr = 48_000.0f32;
        let freq = 1500.0f32;
        let signal: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sr).sin())
            .collect();
        let spectrum = byte_spectrum(&signal, n / 2);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by_key(|&(_, v)| *v)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let expected = (freq * n as f32 / sr).round() as usize;
        assert!(peak.abs_diff(expected) <= 1, "peak {peak} expected {expected}");
    }

    #[tokio::test]
    async fn sampler_buffers_have_equal_length() {
        let capture = SyntheticCapture::new(1);
        let handle = capture
            .acquire(Constraints::Audio(AudioConstraints {
                fft_size: FftSize::new(256).expect("valid"),
                ..AudioConstraints::default()
            }))
            .await
            .expect("granted");
        let sampler = handle.audio_sampler().expect("audio source");
        let sample = sampler.sample().await.expect("live track");
        assert_eq!(sample.frequency.len(), 128);
        assert_eq!(sample.time_domain.len(), 128);
        assert_eq!(sample.sample_rate, sampler.sample_rate());
    }

    #[tokio::test]
    async fn track_label_names_the_camera_facing() {
        let capture = SyntheticCapture::new(1);
        let handle = capture
            .acquire(Constraints::Video(VideoConstraints {
                facing: FacingMode::Environment,
                ..VideoConstraints::default()
            }))
            .await
            .expect("granted");
        assert_eq!(handle.track_labels(), vec!["synthetic camera (environment)"]);
    }

    #[tokio::test]
    async fn unprocessed_audio_is_noisier() {
        async fn variability(constraints: AudioConstraints) -> u32 {
            let capture = SyntheticCapture::new(11);
            let handle = capture
                .acquire(Constraints::Audio(constraints))
                .await
                .expect("granted");
            let sample = handle
                .audio_sampler()
                .expect("audio source")
                .sample()
                .await
                .expect("live track");
            sample
                .time_domain
                .windows(2)
                .map(|w| u32::from(w[0].abs_diff(w[1])))
                .sum()
        }

        let processed = variability(AudioConstraints::default()).await;
        let raw = variability(AudioConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            ..AudioConstraints::default()
        })
        .await;
        assert!(raw > processed * 2, "raw {raw} processed {processed}");
    }
}
