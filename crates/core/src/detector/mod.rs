mod cache;
mod synthetic;

use crate::video::Frame;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use cache::{DetectorCache, DetectorState};
pub use synthetic::{SyntheticLandmarkModel, SyntheticModelFactory};

/// Named indices into the face mesh.
pub mod landmarks {
    use std::ops::Range;

    pub const NOSE_TIP: usize = 1;
    pub const UPPER_LIP: usize = 13;
    pub const LOWER_LIP: usize = 14;
    pub const LEFT_EYE_OUTER: usize = 33;
    pub const LEFT_MOUTH_CORNER: usize = 61;
    pub const RIGHT_EYE_OUTER: usize = 263;
    pub const RIGHT_MOUTH_CORNER: usize = 291;
    pub const MESH_LEN: usize = 468;
    pub const IRIS: Range<usize> = 468..478;
    pub const REFINED_LEN: usize = 478;
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn planar_distance(&self, other: &Point3) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned box in frame pixels.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x_min + self.width / 2.0, self.y_min + self.height / 2.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectedFace {
    /// Pixel coordinates; 468 points, or 478 with refined iris landmarks.
    pub landmarks: Vec<Point3>,
    pub bounding_box: BoundingBox,
    /// Per-subject detection confidence in `[0, 1]`.
    pub score: f32,
}

impl DetectedFace {
    pub fn has_iris(&self) -> bool {
        self.landmarks.len() >= landmarks::REFINED_LEN
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComputeBackend {
    Gpu,
    Cpu,
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeBackend::Gpu => f.write_str("gpu"),
            ComputeBackend::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Refined landmarks (iris points included).
    Full,
    Reduced,
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Full => f.write_str("full"),
            ModelVariant::Reduced => f.write_str("reduced"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelOptions {
    pub max_faces: usize,
    pub refine_landmarks: bool,
}

impl ModelOptions {
    pub fn for_variant(variant: ModelVariant) -> Self {
        Self {
            max_faces: 1,
            refine_landmarks: matches!(variant, ModelVariant::Full),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        backend: ComputeBackend,
        reason: String,
    },

    #[error("no compute backend available (gpu: {gpu}; cpu: {cpu})")]
    NoBackend { gpu: String, cpu: String },

    #[error("{variant} landmark model construction failed: {reason}")]
    ConstructionFailed {
        variant: ModelVariant,
        reason: String,
    },

    #[error("landmark model unavailable (full: {full}; reduced: {reduced})")]
    Unavailable { full: String, reduced: String },

    #[error("landmark estimation failed: {0}")]
    Inference(String),
}

pub trait LandmarkDetector: Send + Sync {
    fn estimate<'a>(
        &'a self,
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<Vec<DetectedFace>, ModelError>>;
}

/// Constructs landmark models. Construction is expensive (hundreds of
/// milliseconds) and must go through [`DetectorCache`].
pub trait LandmarkModelFactory: Send + Sync {
    fn prepare_backend(&self, backend: ComputeBackend) -> BoxFuture<'_, Result<(), ModelError>>;

    fn build(
        &self,
        options: ModelOptions,
    ) -> BoxFuture<'_, Result<Arc<dyn LandmarkDetector>, ModelError>>;
}

/// A constructed model. Immutable once built and shared read-only across ticks.
pub struct DetectorHandle {
    detector: Arc<dyn LandmarkDetector>,
    backend: ComputeBackend,
    variant: ModelVariant,
}

impl DetectorHandle {
    pub fn new(
        detector: Arc<dyn LandmarkDetector>,
        backend: ComputeBackend,
        variant: ModelVariant,
    ) -> Self {
        Self {
            detector,
            backend,
            variant,
        }
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub async fn estimate(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ModelError> {
        self.detector.estimate(frame).await
    }
}

impl fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("backend", &self.backend)
            .field("variant", &self.variant)
            .finish()
    }
}
