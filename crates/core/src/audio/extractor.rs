use crate::audio::{AudioAnalysisResult, AudioSample, AudioSampler};
use crate::emotion::{unit, EmotionalState};
use crate::scheduler::{ExtractError, Extractor};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LOG_TARGET: &str = "audio";

const BYTE_MAX: f32 = 255.0;
const CLARITY_BAND: f32 = 0.4;
const PITCH_LOW_HZ: f32 = 85.0;
const PITCH_HIGH_HZ: f32 = 255.0;
const HIGH_PITCH: f32 = 0.7;

/// Signal proxies computed from one sample, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioFeatures {
    pub volume: f32,
    pub clarity: f32,
    pub pitch: f32,
    pub variability: f32,
    /// Peak of the low band in Hz, before normalization.
    pub pitch_hz: f32,
}

impl AudioFeatures {
    pub fn is_silent(&self) -> bool {
        self.volume <= 0.0
    }
}

/// Maps signal features to affect scores. The heuristic default is a
/// placeholder, not a validated classifier; swap it here.
pub trait AudioScoring: Send + Sync {
    fn emotions(&self, features: &AudioFeatures) -> EmotionalState;

    fn sentiment(&self, emotions: &EmotionalState, features: &AudioFeatures) -> f32;

    fn toxicity(&self, features: &AudioFeatures) -> f32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicAudioScoring;

impl AudioScoring for HeuristicAudioScoring {
    fn emotions(&self, f: &AudioFeatures) -> EmotionalState {
        EmotionalState::from_components(
            0.4 * f.pitch + 0.3 * f.volume + 0.3 * f.clarity,
            0.4 * (1.0 - f.pitch) + 0.4 * (1.0 - f.volume),
            0.5 * f.volume + 0.3 * f.pitch,
            0.4 * f.pitch + 0.3 * f.volume,
            0.5 * f.pitch + 0.3 * f.volume,
        )
    }

    fn sentiment(&self, e: &EmotionalState, f: &AudioFeatures) -> f32 {
        unit(
            0.5 + 0.5 * e.joy + 0.2 * e.surprise + 0.2 * f.clarity
                - 0.4 * e.sadness
                - 0.4 * e.anger
                - 0.2 * e.fear,
        )
    }

    fn toxicity(&self, f: &AudioFeatures) -> f32 {
        let shrill = if f.pitch > HIGH_PITCH { 0.4 * f.pitch } else { 0.0 };
        unit(0.3 * f.volume + shrill + 0.3 * f.variability)
    }
}

#[derive(Clone)]
pub struct AudioFeatureExtractor {
    scoring: Arc<dyn AudioScoring>,
}

impl Default for AudioFeatureExtractor {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicAudioScoring))
    }
}

impl AudioFeatureExtractor {
    pub fn new(scoring: Arc<dyn AudioScoring>) -> Self {
        Self { scoring }
    }

    pub fn features(&self, sample: &AudioSample) -> Result<AudioFeatures, ExtractError> {
        let n = sample.frequency.len();
        if n == 0 {
            return Err(ExtractError::TransientFrameFailure(
                "empty frequency buffer".to_owned(),
            ));
        }
        if sample.time_domain.len() != n {
            return Err(ExtractError::TransientFrameFailure(format!(
                "frequency/time-domain length mismatch: {n} vs {}",
                sample.time_domain.len()
            )));
        }
        if sample.sample_rate == 0 {
            return Err(ExtractError::TransientFrameFailure(
                "sample rate is zero".to_owned(),
            ));
        }

        let bins = &sample.frequency;
        let total: f32 = bins.iter().map(|&b| f32::from(b)).sum();
        let volume = unit(total / n as f32 / BYTE_MAX);

        let band = ((n as f32 * CLARITY_BAND).round() as usize).clamp(1, n);
        let upper: f32 = bins[n - band..].iter().map(|&b| f32::from(b)).sum();
        let clarity = if total > 0.0 { unit(upper / total) } else { 0.0 };

        let low = (n / 4).max(1);
        let mut peak = 0usize;
        for (i, &b) in bins[..low].iter().enumerate() {
            if b > bins[peak] {
                peak = i;
            }
        }
        let pitch_hz = peak as f32 * sample.sample_rate as f32 / (2.0 * n as f32);
        let pitch = unit((pitch_hz - PITCH_LOW_HZ) / (PITCH_HIGH_HZ - PITCH_LOW_HZ));

        let variability = if n > 1 {
            let steps: f32 = sample
                .time_domain
                .windows(2)
                .map(|w| (f32::from(w[1]) - f32::from(w[0])).abs())
                .sum();
            unit(steps / (n - 1) as f32 / BYTE_MAX)
        } else {
            0.0
        };

        Ok(AudioFeatures {
            volume,
            clarity,
            pitch,
            variability,
            pitch_hz,
        })
    }

    pub fn score(&self, features: &AudioFeatures) -> AudioAnalysisResult {
        // Nothing to infer from silence.
        let emotions = if features.is_silent() {
            EmotionalState::neutral()
        } else {
            self.scoring.emotions(features)
        };
        AudioAnalysisResult {
            sentiment: unit(self.scoring.sentiment(&emotions, features)),
            toxicity: unit(self.scoring.toxicity(features)),
            emotions,
            volume: features.volume,
            clarity: features.clarity,
        }
    }

    pub fn try_analyze(&self, sample: &AudioSample) -> Result<AudioAnalysisResult, ExtractError> {
        let features = self.features(sample)?;
        let result = self.score(&features);
        result.validate()?;
        Ok(result)
    }

    /// Never fails: errors degrade to [`AudioAnalysisResult::silent`].
    pub fn analyze(&self, sample: &AudioSample) -> AudioAnalysisResult {
        self.try_analyze(sample).unwrap_or_else(|err| {
            tracing::warn!(target: LOG_TARGET, error = %err, "audio analysis failed; using silent result");
            AudioAnalysisResult::silent()
        })
    }
}

/// Per-tick audio extraction: read the analyser and score it.
pub struct AudioAnalyzer {
    sampler: Arc<dyn AudioSampler>,
    extractor: AudioFeatureExtractor,
}

impl AudioAnalyzer {
    pub fn new(sampler: Arc<dyn AudioSampler>, extractor: AudioFeatureExtractor) -> Self {
        Self { sampler, extractor }
    }
}

impl Extractor for AudioAnalyzer {
    type Output = AudioAnalysisResult;

    fn extract(&self) -> BoxFuture<'_, AudioAnalysisResult> {
        async move {
            match self.sampler.sample().await {
                Ok(sample) => self.extractor.analyze(&sample),
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, error = %err, "audio sample failed; using silent result");
                    AudioAnalysisResult::silent()
                }
            }
        }
        .boxed()
    }

    fn fallback(&self) -> AudioAnalysisResult {
        AudioAnalysisResult::silent()
    }
}
