mod extractor;

use crate::capture::CaptureError;
use crate::emotion::{check_unit, EmotionalState, ShapeError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use extractor::{
    AudioAnalyzer, AudioFeatureExtractor, AudioFeatures, AudioScoring, HeuristicAudioScoring,
};

/// One analyser snapshot: byte magnitudes per frequency bin and the matching
/// number of byte time-domain samples (128 is silence).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioSample {
    pub frequency: Vec<u8>,
    pub time_domain: Vec<u8>,
    pub sample_rate: u32,
}

/// Live-audio sampling capability of a microphone stream.
pub trait AudioSampler: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn sample(&self) -> BoxFuture<'_, Result<AudioSample, CaptureError>>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioAnalysisResult {
    pub sentiment: f32,
    pub toxicity: f32,
    pub emotions: EmotionalState,
    pub volume: f32,
    pub clarity: f32,
}

impl AudioAnalysisResult {
    /// Result for silence, and for samples that failed.
    pub fn silent() -> Self {
        Self {
            sentiment: 0.5,
            toxicity: 0.0,
            emotions: EmotionalState::neutral(),
            volume: 0.0,
            clarity: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        self.emotions.validate()?;
        check_unit("sentiment", self.sentiment)?;
        check_unit("toxicity", self.toxicity)?;
        check_unit("volume", self.volume)?;
        check_unit("clarity", self.clarity)
    }
}
