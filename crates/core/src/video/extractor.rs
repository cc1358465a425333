use crate::detector::{landmarks, DetectedFace, DetectorHandle, Point3};
use crate::emotion::{unit, EmotionalState};
use crate::scheduler::{ExtractError, Extractor};
use crate::video::{ContextTag, Frame, FrameSource, VideoAnalysisResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

const LOG_TARGET: &str = "video";

const MIN_MOUTH_HEIGHT_PX: f32 = 1.0;
const MIN_EYE_DISTANCE_PX: f32 = 1.0;

const HIGH_RES_PIXELS: u64 = 1280 * 720;
const MEDIUM_RES_PIXELS: u64 = 640 * 480;
const CLOSE_AREA_RATIO: f32 = 0.25;
const MEDIUM_AREA_RATIO: f32 = 0.08;
const CENTERED_OFFSET: f32 = 0.15;
const WELL_LIT_SCORE: f32 = 0.9;
const MODERATE_LIGHT_SCORE: f32 = 0.7;

/// Turns the landmarks of one frame into emotion, attention and capture context.
#[derive(Clone, Copy, Debug, Default)]
pub struct VideoFeatureExtractor;

impl VideoFeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Never fails: errors degrade to [`VideoAnalysisResult::no_face`].
    pub async fn analyze(&self, frame: &Frame, detector: &DetectorHandle) -> VideoAnalysisResult {
        match self.try_analyze(frame, detector).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, sequence = frame.sequence, error = %err, "frame analysis failed; using neutral result");
                VideoAnalysisResult::no_face()
            }
        }
    }

    pub async fn try_analyze(
        &self,
        frame: &Frame,
        detector: &DetectorHandle,
    ) -> Result<VideoAnalysisResult, ExtractError> {
        let faces = detector.estimate(frame).await?;
        self.from_faces(frame, &faces)
    }

    /// Only the first face is used.
    pub fn from_faces(
        &self,
        frame: &Frame,
        faces: &[DetectedFace],
    ) -> Result<VideoAnalysisResult, ExtractError> {
        let Some(face) = faces.first() else {
            return Ok(VideoAnalysisResult::no_face());
        };
        if face.landmarks.len() < landmarks::MESH_LEN {
            return Err(ExtractError::TransientFrameFailure(format!(
                "expected at least {} landmarks, got {}",
                landmarks::MESH_LEN,
                face.landmarks.len()
            )));
        }

        let result = VideoAnalysisResult {
            emotions: face_emotions(face),
            attentiveness: attentiveness(face),
            environmental_context: environmental_context(frame, face),
        };
        result.validate()?;
        Ok(result)
    }
}

fn eye_distance(face: &DetectedFace) -> f32 {
    let p = &face.landmarks;
    p[landmarks::LEFT_EYE_OUTER]
        .planar_distance(&p[landmarks::RIGHT_EYE_OUTER])
        .max(MIN_EYE_DISTANCE_PX)
}

fn face_emotions(face: &DetectedFace) -> EmotionalState {
    let p = &face.landmarks;
    let upper = p[landmarks::UPPER_LIP];
    let lower = p[landmarks::LOWER_LIP];
    let left = p[landmarks::LEFT_MOUTH_CORNER];
    let right = p[landmarks::RIGHT_MOUTH_CORNER];

    // Image y grows downward: corners above the mouth center read as a smile.
    let mouth_height = (lower.y - upper.y).abs().max(MIN_MOUTH_HEIGHT_PX);
    let center_y = (upper.y + lower.y) / 2.0;
    let corner_mid_y = (left.y + right.y) / 2.0;
    let smile = unit((center_y - corner_mid_y) / mouth_height);

    let eye_ratio = left.planar_distance(&right) / eye_distance(face);

    let joy = smile;
    let sadness = 0.3 * (1.0 - smile);
    let surprise = unit(2.0 * (eye_ratio - 0.5));
    let anger = 0.2 * (1.0 - eye_ratio);
    let fear = 0.3 * surprise;

    EmotionalState::from_components(joy, sadness, anger, fear, surprise)
}

fn iris_x(face: &DetectedFace) -> f32 {
    let p = &face.landmarks;
    if face.has_iris() {
        let iris = &p[landmarks::IRIS];
        return iris.iter().map(|pt| pt.x).sum::<f32>() / iris.len() as f32;
    }
    // Reduced models carry no iris points; the eye midpoint stands in.
    (p[landmarks::LEFT_EYE_OUTER].x + p[landmarks::RIGHT_EYE_OUTER].x) / 2.0
}

fn attentiveness(face: &DetectedFace) -> f32 {
    let nose: Point3 = face.landmarks[landmarks::NOSE_TIP];
    let deviation = (iris_x(face) - nose.x).abs() / eye_distance(face);
    unit((1.0 - 2.0 * deviation) * unit(face.score))
}

fn environmental_context(frame: &Frame, face: &DetectedFace) -> Vec<ContextTag> {
    let mut tags = Vec::with_capacity(5);

    let pixels = u64::from(frame.width) * u64::from(frame.height);
    tags.push(if pixels >= HIGH_RES_PIXELS {
        ContextTag::HighResolution
    } else if pixels >= MEDIUM_RES_PIXELS {
        ContextTag::MediumResolution
    } else {
        ContextTag::LowResolution
    });

    let frame_w = (frame.width as f32).max(1.0);
    let frame_h = (frame.height as f32).max(1.0);
    let area_ratio = face.bounding_box.area() / (frame_w * frame_h);
    tags.push(if area_ratio > CLOSE_AREA_RATIO {
        ContextTag::CloseDistance
    } else if area_ratio > MEDIUM_AREA_RATIO {
        ContextTag::MediumDistance
    } else {
        ContextTag::FarDistance
    });

    let (bx, by) = face.bounding_box.center();
    let offset = ((bx - frame_w / 2.0).abs() / frame_w).max((by - frame_h / 2.0).abs() / frame_h);
    tags.push(if offset <= CENTERED_OFFSET {
        ContextTag::Centered
    } else {
        ContextTag::OffCenter
    });

    tags.push(if face.score >= WELL_LIT_SCORE {
        ContextTag::WellLit
    } else if face.score >= MODERATE_LIGHT_SCORE {
        ContextTag::ModerateLighting
    } else {
        ContextTag::PoorLighting
    });

    tags.push(ContextTag::Indoor);
    tags
}

/// Per-tick video extraction: grab the latest frame and analyze it.
pub struct VideoAnalyzer {
    frames: Arc<dyn FrameSource>,
    detector: Arc<DetectorHandle>,
    extractor: VideoFeatureExtractor,
}

impl VideoAnalyzer {
    pub fn new(frames: Arc<dyn FrameSource>, detector: Arc<DetectorHandle>) -> Self {
        Self {
            frames,
            detector,
            extractor: VideoFeatureExtractor::new(),
        }
    }
}

impl Extractor for VideoAnalyzer {
    type Output = VideoAnalysisResult;

    fn extract(&self) -> BoxFuture<'_, VideoAnalysisResult> {
        async move {
            match self.frames.grab().await {
                Ok(frame) => self.extractor.analyze(&frame, &self.detector).await,
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, error = %err, "frame grab failed; using neutral result");
                    VideoAnalysisResult::no_face()
                }
            }
        }
        .boxed()
    }

    fn fallback(&self) -> VideoAnalysisResult {
        VideoAnalysisResult::no_face()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{BoundingBox, ComputeBackend, ModelVariant, SyntheticLandmarkModel};
    use bytes::Bytes;

    fn frame(width: u32, height: u32) -> Frame {
        Frame {
            width,
            height,
            sequence: 0,
            pixels: Bytes::new(),
        }
    }

    /// A face centered at (320, 240) with the mouth corners raised by `lift`
    /// pixels and the iris shifted by `gaze` pixels.
    fn face(lift: f32, gaze: f32, score: f32, refined: bool) -> DetectedFace {
        let len = if refined {
            landmarks::REFINED_LEN
        } else {
            landmarks::MESH_LEN
        };
        let mut p = vec![Point3::new(320.0, 240.0, 0.0); len];
        p[landmarks::LEFT_EYE_OUTER] = Point3::new(270.0, 200.0, 0.0);
        p[landmarks::RIGHT_EYE_OUTER] = Point3::new(370.0, 200.0, 0.0);
        p[landmarks::NOSE_TIP] = Point3::new(320.0, 240.0, 0.0);
        p[landmarks::UPPER_LIP] = Point3::new(320.0, 275.0, 0.0);
        p[landmarks::LOWER_LIP] = Point3::new(320.0, 285.0, 0.0);
        p[landmarks::LEFT_MOUTH_CORNER] = Point3::new(295.0, 280.0 - lift, 0.0);
        p[landmarks::RIGHT_MOUTH_CORNER] = Point3::new(345.0, 280.0 - lift, 0.0);
        if refined {
            for idx in landmarks::IRIS {
                p[idx] = Point3::new(320.0 + gaze, 200.0, 0.0);
            }
        }
        DetectedFace {
            landmarks: p,
            bounding_box: BoundingBox {
                x_min: 170.0,
                y_min: 90.0,
                width: 300.0,
                height: 300.0,
            },
            score,
        }
    }

    #[test]
    fn no_faces_is_a_defined_neutral_result() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[])
            .expect("no face is not an error");
        assert_eq!(result.attentiveness, 0.0);
        assert_eq!(result.environmental_context, vec![ContextTag::NoFaceDetected]);
        assert_eq!(result.emotions, EmotionalState::neutral());
    }

    #[test]
    fn raised_corners_read_as_joy() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(8.0, 0.0, 0.95, true)])
            .expect("valid face");
        assert!((result.emotions.joy - 0.8).abs() < 1e-4);
        assert!((result.emotions.sadness - 0.06).abs() < 1e-4);
        assert!(result.emotions.neutral >= 0.1);
    }

    #[test]
    fn lowered_corners_read_as_sadness() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(-6.0, 0.0, 0.95, true)])
            .expect("valid face");
        assert_eq!(result.emotions.joy, 0.0);
        assert!((result.emotions.sadness - 0.3).abs() < 1e-4);
    }

    #[test]
    fn mouth_to_eye_ratio_drives_surprise_and_anger() {
        // mouth width 50 / eye distance 100 = 0.5
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 0.0, 0.95, true)])
            .expect("valid face");
        assert_eq!(result.emotions.surprise, 0.0);
        assert_eq!(result.emotions.fear, 0.0);
        assert!((result.emotions.anger - 0.1).abs() < 1e-4);
    }

    #[test]
    fn gaze_on_nose_keeps_full_attention_scaled_by_score() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 0.0, 0.8, true)])
            .expect("valid face");
        assert!((result.attentiveness - 0.8).abs() < 1e-4);
    }

    #[test]
    fn averted_gaze_drops_attention() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 25.0, 1.0, true)])
            .expect("valid face");
        assert!((result.attentiveness - 0.5).abs() < 1e-4);

        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 60.0, 1.0, true)])
            .expect("valid face");
        assert_eq!(result.attentiveness, 0.0);
    }

    #[test]
    fn reduced_mesh_uses_eye_midpoint() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 40.0, 0.9, false)])
            .expect("valid face");
        assert!((result.attentiveness - 0.9).abs() < 1e-4);
    }

    #[test]
    fn context_tags_follow_fixed_order() {
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[face(0.0, 0.0, 0.95, true)])
            .expect("valid face");
        assert_eq!(
            result.environmental_context,
            vec![
                ContextTag::MediumResolution,
                ContextTag::CloseDistance,
                ContextTag::Centered,
                ContextTag::WellLit,
                ContextTag::Indoor,
            ]
        );

        let mut far = face(0.0, 0.0, 0.5, true);
        far.bounding_box = BoundingBox {
            x_min: 0.0,
            y_min: 0.0,
            width: 40.0,
            height: 40.0,
        };
        let result = VideoFeatureExtractor::new()
            .from_faces(&frame(320, 240), &[far])
            .expect("valid face");
        assert_eq!(
            result.environmental_context,
            vec![
                ContextTag::LowResolution,
                ContextTag::FarDistance,
                ContextTag::OffCenter,
                ContextTag::PoorLighting,
                ContextTag::Indoor,
            ]
        );
    }

    #[test]
    fn truncated_landmarks_are_a_transient_failure() {
        let mut broken = face(0.0, 0.0, 0.9, false);
        broken.landmarks.truncate(10);
        let err = VideoFeatureExtractor::new()
            .from_faces(&frame(640, 480), &[broken])
            .unwrap_err();
        assert!(matches!(err, ExtractError::TransientFrameFailure(_)));
    }

    #[tokio::test]
    async fn model_errors_degrade_to_neutral() {
        let handle = DetectorHandle::new(
            Arc::new(SyntheticLandmarkModel::new(1, true, None)),
            ComputeBackend::Cpu,
            ModelVariant::Full,
        );
        // The synthetic model rejects zero-sized frames.
        let result = VideoFeatureExtractor::new().analyze(&frame(0, 0), &handle).await;
        assert_eq!(result, VideoAnalysisResult::no_face());
    }

    #[tokio::test]
    async fn emotions_stay_in_range_across_expressions() {
        let handle = DetectorHandle::new(
            Arc::new(SyntheticLandmarkModel::new(9, true, None)),
            ComputeBackend::Gpu,
            ModelVariant::Full,
        );
        let extractor = VideoFeatureExtractor::new();
        for sequence in 0..120 {
            let mut f = frame(1280, 720);
            f.sequence = sequence;
            let result = extractor.analyze(&f, &handle).await;
            assert!(result.validate().is_ok(), "frame {sequence}: {result:?}");
            let total: f32 = result.emotions.components().iter().map(|(_, v)| v).sum();
            assert!(total > 0.0);
            assert!(result.emotions.neutral >= 0.1);
        }
    }
}
