use crate::detector::{
    landmarks, BoundingBox, ComputeBackend, DetectedFace, LandmarkDetector, LandmarkModelFactory,
    ModelError, ModelOptions, ModelVariant, Point3,
};
use crate::video::Frame;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Factory for [`SyntheticLandmarkModel`] with switchable failure modes.
#[derive(Clone)]
pub struct SyntheticModelFactory {
    seed: u64,
    gpu_available: bool,
    cpu_available: bool,
    full_fails: bool,
    reduced_fails: bool,
    build_delay: Duration,
    absent_every: Option<u64>,
    build_calls: Arc<AtomicUsize>,
}

impl SyntheticModelFactory {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            gpu_available: true,
            cpu_available: true,
            full_fails: false,
            reduced_fails: false,
            build_delay: Duration::ZERO,
            absent_every: None,
            build_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn without_gpu(mut self) -> Self {
        self.gpu_available = false;
        self
    }

    pub fn without_backends(mut self) -> Self {
        self.gpu_available = false;
        self.cpu_available = false;
        self
    }

    pub fn failing_full(mut self) -> Self {
        self.full_fails = true;
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.full_fails = true;
        self.reduced_fails = true;
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Report no face on every `n`-th frame.
    pub fn with_absent_every(mut self, n: u64) -> Self {
        self.absent_every = (n > 0).then_some(n);
        self
    }

    /// Number of `build` calls across every clone of this factory.
    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }
}

impl LandmarkModelFactory for SyntheticModelFactory {
    fn prepare_backend(&self, backend: ComputeBackend) -> BoxFuture<'_, Result<(), ModelError>> {
        async move {
            let available = match backend {
                ComputeBackend::Gpu => self.gpu_available,
                ComputeBackend::Cpu => self.cpu_available,
            };
            if available {
                Ok(())
            } else {
                Err(ModelError::BackendUnavailable {
                    backend,
                    reason: "no adapter reported".to_owned(),
                })
            }
        }
        .boxed()
    }

    fn build(
        &self,
        options: ModelOptions,
    ) -> BoxFuture<'_, Result<Arc<dyn LandmarkDetector>, ModelError>> {
        async move {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            if !self.build_delay.is_zero() {
                tokio::time::sleep(self.build_delay).await;
            }

            let variant = if options.refine_landmarks {
                ModelVariant::Full
            } else {
                ModelVariant::Reduced
            };
            let fails = match variant {
                ModelVariant::Full => self.full_fails,
                ModelVariant::Reduced => self.reduced_fails,
            };
            if fails {
                return Err(ModelError::ConstructionFailed {
                    variant,
                    reason: "out of memory while loading weights".to_owned(),
                });
            }

            let model: Arc<dyn LandmarkDetector> = Arc::new(SyntheticLandmarkModel::new(
                self.seed,
                options.refine_landmarks,
                self.absent_every,
            ));
            Ok(model)
        }
        .boxed()
    }
}

/// Produces one plausible face per frame whose expression and gaze drift
/// with the frame sequence number.
pub struct SyntheticLandmarkModel {
    refine: bool,
    absent_every: Option<u64>,
    rng: Mutex<StdRng>,
}

impl SyntheticLandmarkModel {
    pub fn new(seed: u64, refine: bool, absent_every: Option<u64>) -> Self {
        Self {
            refine,
            absent_every,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn jitter(&self) -> f32 {
        let mut rng = match self.rng.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.random_range(-1.0..1.0)
    }

    fn face_for(&self, frame: &Frame) -> DetectedFace {
        let w = frame.width as f32;
        let h = frame.height as f32;
        let phase = frame.sequence as f32 * 0.45;

        let face_w = w * (0.38 + 0.08 * (phase * 0.3).sin());
        let face_h = face_w * 1.25;
        let cx = w / 2.0 + w * 0.06 * (phase * 0.5).sin();
        let cy = h / 2.0;
        let bounding_box = BoundingBox {
            x_min: cx - face_w / 2.0,
            y_min: cy - face_h / 2.0,
            width: face_w,
            height: face_h,
        };

        let len = if self.refine {
            landmarks::REFINED_LEN
        } else {
            landmarks::MESH_LEN
        };
        let mut points = vec![Point3::new(cx, cy, 0.0); len];

        let eye_y = bounding_box.y_min + face_h * 0.38;
        let eye_dx = face_w * 0.22;
        points[landmarks::LEFT_EYE_OUTER] = Point3::new(cx - eye_dx, eye_y, 0.0);
        points[landmarks::RIGHT_EYE_OUTER] = Point3::new(cx + eye_dx, eye_y, 0.0);

        let nose = Point3::new(cx, bounding_box.y_min + face_h * 0.55, -10.0);
        points[landmarks::NOSE_TIP] = nose;

        let smile = 0.5 + 0.5 * phase.sin();
        let mouth_y = bounding_box.y_min + face_h * 0.75;
        let mouth_open = face_h * (0.02 + 0.05 * (phase * 0.8).cos().abs());
        let half_width = face_w * (0.11 + 0.05 * (phase * 0.6).sin().abs());
        let corner_y = mouth_y - smile * mouth_open;
        points[landmarks::UPPER_LIP] = Point3::new(cx, mouth_y - mouth_open / 2.0, 0.0);
        points[landmarks::LOWER_LIP] = Point3::new(cx, mouth_y + mouth_open / 2.0, 0.0);
        points[landmarks::LEFT_MOUTH_CORNER] = Point3::new(cx - half_width, corner_y, 0.0);
        points[landmarks::RIGHT_MOUTH_CORNER] = Point3::new(cx + half_width, corner_y, 0.0);

        if self.refine {
            let gaze = eye_dx * 0.4 * (phase * 0.35).sin();
            for (i, idx) in landmarks::IRIS.enumerate() {
                let side = if i < 5 { -eye_dx } else { eye_dx };
                points[idx] = Point3::new(cx + side + gaze, eye_y, 0.0);
            }
        }

        let score = (0.86 + 0.08 * (phase * 0.2).cos() + 0.02 * self.jitter()).clamp(0.0, 1.0);

        DetectedFace {
            landmarks: points,
            bounding_box,
            score,
        }
    }
}

impl LandmarkDetector for SyntheticLandmarkModel {
    fn estimate<'a>(
        &'a self,
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<Vec<DetectedFace>, ModelError>> {
        async move {
            if frame.width == 0 || frame.height == 0 {
                return Err(ModelError::Inference("empty frame".to_owned()));
            }
            if !frame.pixels.is_empty() && frame.pixels.len() != frame.expected_pixel_len() {
                return Err(ModelError::Inference(format!(
                    "pixel buffer holds {} bytes, expected {} for {}x{} RGBA",
                    frame.pixels.len(),
                    frame.expected_pixel_len(),
                    frame.width,
                    frame.height
                )));
            }
            if let Some(n) = self.absent_every {
                if frame.sequence % n == n - 1 {
                    return Ok(Vec::new());
                }
            }
            Ok(vec![self.face_for(frame)])
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(sequence: u64) -> Frame {
        Frame {
            width: 640,
            height: 480,
            sequence,
            pixels: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn refined_model_emits_iris_points() {
        let model = SyntheticLandmarkModel::new(1, true, None);
        let faces = model.estimate(&frame(0)).await.expect("estimate");
        assert_eq!(faces.len(), 1);
        assert!(faces[0].has_iris());

        let reduced = SyntheticLandmarkModel::new(1, false, None);
        let faces = reduced.estimate(&frame(0)).await.expect("estimate");
        assert_eq!(faces[0].landmarks.len(), landmarks::MESH_LEN);
    }

    #[tokio::test]
    async fn rejects_truncated_pixel_buffers() {
        let model = SyntheticLandmarkModel::new(1, true, None);
        let mut f = frame(0);
        f.pixels = Bytes::from(vec![0u8; 640 * 480 * 4]);
        assert!(model.estimate(&f).await.is_ok());

        f.pixels = Bytes::from(vec![0u8; 640 * 480 * 3]);
        assert!(matches!(
            model.estimate(&f).await,
            Err(ModelError::Inference(_))
        ));
    }

    #[tokio::test]
    async fn absent_every_drops_faces_periodically() {
        let model = SyntheticLandmarkModel::new(1, true, Some(3));
        let mut empty = 0;
        for seq in 0..9 {
            if model.estimate(&frame(seq)).await.expect("estimate").is_empty() {
                empty += 1;
            }
        }
        assert_eq!(empty, 3);
    }
}
