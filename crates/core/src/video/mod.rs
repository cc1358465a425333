mod extractor;

use crate::capture::CaptureError;
use crate::emotion::{check_unit, EmotionalState, ShapeError};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use extractor::{VideoAnalyzer, VideoFeatureExtractor};

#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    /// Tightly packed RGBA; empty for sources that hand landmark models their
    /// own buffers.
    pub pixels: Bytes,
}

pub const BYTES_PER_PIXEL: usize = 4;

impl Frame {
    /// Length `pixels` must have when it is populated.
    pub fn expected_pixel_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Latest-frame access to a live camera stream.
pub trait FrameSource: Send + Sync {
    fn grab(&self) -> BoxFuture<'_, Result<Frame, CaptureError>>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    NoFaceDetected,
    HighResolution,
    MediumResolution,
    LowResolution,
    CloseDistance,
    MediumDistance,
    FarDistance,
    Centered,
    OffCenter,
    WellLit,
    ModerateLighting,
    PoorLighting,
    Indoor,
}

impl ContextTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTag::NoFaceDetected => "no_face_detected",
            ContextTag::HighResolution => "high_resolution",
            ContextTag::MediumResolution => "medium_resolution",
            ContextTag::LowResolution => "low_resolution",
            ContextTag::CloseDistance => "close_distance",
            ContextTag::MediumDistance => "medium_distance",
            ContextTag::FarDistance => "far_distance",
            ContextTag::Centered => "centered",
            ContextTag::OffCenter => "off_center",
            ContextTag::WellLit => "well_lit",
            ContextTag::ModerateLighting => "moderate_lighting",
            ContextTag::PoorLighting => "poor_lighting",
            ContextTag::Indoor => "indoor",
        }
    }
}

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoAnalysisResult {
    pub emotions: EmotionalState,
    pub attentiveness: f32,
    pub environmental_context: Vec<ContextTag>,
}

impl VideoAnalysisResult {
    /// Result for a frame without a subject, and for frames that failed.
    pub fn no_face() -> Self {
        Self {
            emotions: EmotionalState::neutral(),
            attentiveness: 0.0,
            environmental_context: vec![ContextTag::NoFaceDetected],
        }
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        self.emotions.validate()?;
        check_unit("attentiveness", self.attentiveness)
    }
}
