//! Embedder adapter: the only module that touches the vision stack.
//!
//! Wraps an ONNX face detector and a face embedder behind the
//! [`FaceEmbedder`] trait so the rest of the service treats detection and
//! embedding as an opaque call producing a 128-D descriptor.

use std::path::Path;
use std::sync::Mutex;

use image::DynamicImage;
use ort::inputs;
use ort::session::{builder::SessionBuilder, Session};
use ort::value::Value;

use crate::error::RecognitionError;

/// Descriptor dimensionality produced by the embedder model.
pub const DESCRIPTOR_DIM: usize = 128;

/// Accepted input image side lengths, pixels.
const MIN_IMAGE_SIDE: u32 = 200;
const MAX_IMAGE_SIDE: u32 = 4000;

/// Detector input resolution.
const DETECTOR_SIDE: u32 = 320;
/// Embedder input resolution (square face crop).
const EMBEDDER_SIDE: u32 = 112;

/// Detector profile selector.
///
/// Register and Precise run the detector at its high-precision operating
/// point; Recognize trades a lower score floor for throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    Register,
    Recognize,
    Precise,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Register => "register",
            DetectionMode::Recognize => "recognize",
            DetectionMode::Precise => "precise",
        }
    }
}

/// Detected face bounding box, pixels, origin top-left.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One detected-and-embedded face.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub descriptor: Vec<f32>,
    pub bounding_box: FaceBox,
    pub detection_score: f32,
    pub has_landmarks: bool,
}

/// Per-mode detector score floors.
#[derive(Debug, Clone, Copy)]
pub struct DetectorProfile {
    pub register_floor: f32,
    pub recognize_floor: f32,
    pub precise_floor: f32,
}

impl DetectorProfile {
    fn floor(&self, mode: DetectionMode) -> f32 {
        match mode {
            DetectionMode::Register => self.register_floor,
            DetectionMode::Recognize => self.recognize_floor,
            DetectionMode::Precise => self.precise_floor,
        }
    }
}

impl Default for DetectorProfile {
    fn default() -> Self {
        Self {
            register_floor: 0.8,
            recognize_floor: 0.6,
            precise_floor: 0.9,
        }
    }
}

/// Detect the most prominent face in an image and embed it.
///
/// Implementations are blocking; callers offload to a blocking thread and
/// apply their own timeout.
pub trait FaceEmbedder: Send + Sync {
    fn detect_and_embed(
        &self,
        image: &[u8],
        mode: DetectionMode,
    ) -> Result<FaceObservation, RecognitionError>;

    /// Run one synthetic inference so first real requests pay no model
    /// initialization cost. Called once at startup.
    fn warmup(&self) -> Result<(), RecognitionError>;

    /// (used bytes, total bytes) of the inference device, when the backend
    /// exposes it. CPU providers return None.
    fn device_memory(&self) -> Option<(u64, u64)> {
        None
    }
}

/// Decode and validate a query image.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, RecognitionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| RecognitionError::InvalidImage(e.to_string()))?;

    let (w, h) = (img.width(), img.height());
    if w < MIN_IMAGE_SIDE || h < MIN_IMAGE_SIDE {
        return Err(RecognitionError::InvalidImage(format!(
            "image {}x{} below minimum {}x{}",
            w, h, MIN_IMAGE_SIDE, MIN_IMAGE_SIDE
        )));
    }
    if w > MAX_IMAGE_SIDE || h > MAX_IMAGE_SIDE {
        return Err(RecognitionError::InvalidImage(format!(
            "image {}x{} above maximum {}x{}",
            w, h, MAX_IMAGE_SIDE, MAX_IMAGE_SIDE
        )));
    }
    Ok(img)
}

/// ONNX-backed implementation: a face detector session plus a face embedder
/// session, both CPU with one intra-op thread to avoid oversubscription in
/// the async host.
pub struct OnnxEmbedder {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
    profile: DetectorProfile,
}

impl OnnxEmbedder {
    pub fn new(
        detector_model: &Path,
        embedder_model: &Path,
        profile: DetectorProfile,
    ) -> Result<Self, RecognitionError> {
        // ORT environment is process-global; a second init is a no-op.
        let _ = ort::init().with_name("visage").commit();

        let detector = SessionBuilder::new()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(detector_model))
            .map_err(|e| RecognitionError::internal(format!("loading detector model: {}", e)))?;

        let embedder = SessionBuilder::new()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(embedder_model))
            .map_err(|e| RecognitionError::internal(format!("loading embedder model: {}", e)))?;

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            profile,
        })
    }

    /// Run the detector; return (box, score, has_landmarks) of the best face
    /// at or above `floor`.
    fn detect(
        &self,
        img: &DynamicImage,
        floor: f32,
    ) -> Result<Option<(FaceBox, f32, bool)>, RecognitionError> {
        let input = image_to_chw(img, DETECTOR_SIDE);
        let input_value = Value::from_array((
            vec![1usize, 3, DETECTOR_SIDE as usize, DETECTOR_SIDE as usize],
            input,
        ))
        .map_err(|e| RecognitionError::internal(format!("detector input: {}", e)))?;

        let mut session = self
            .detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session
            .run(inputs![input_value])
            .map_err(|e| RecognitionError::internal(format!("detector inference: {}", e)))?;

        // Output 0: scores [1, N]; output 1: boxes [1, N, 4] normalized
        // (x, y, w, h); optional output 2: landmarks.
        let scores = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognitionError::internal(format!("detector scores: {}", e)))?;
        let boxes = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognitionError::internal(format!("detector boxes: {}", e)))?;
        let has_landmarks = outputs.len() > 2;

        let scores = scores.1;
        let boxes = boxes.1;

        let mut best: Option<(usize, f32)> = None;
        for (i, &score) in scores.iter().enumerate() {
            if score >= floor && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((i, score));
            }
        }
        let Some((best_idx, best_score)) = best else {
            return Ok(None);
        };

        let base = best_idx * 4;
        if base + 3 >= boxes.len() {
            return Err(RecognitionError::internal("detector box tensor too short"));
        }
        let (img_w, img_h) = (img.width() as f32, img.height() as f32);
        let x = (boxes[base] * img_w).clamp(0.0, img_w);
        let y = (boxes[base + 1] * img_h).clamp(0.0, img_h);
        let w = (boxes[base + 2] * img_w).clamp(1.0, img_w - x);
        let h = (boxes[base + 3] * img_h).clamp(1.0, img_h - y);

        Ok(Some((
            FaceBox {
                x: x as u32,
                y: y as u32,
                width: w as u32,
                height: h as u32,
            },
            best_score,
            has_landmarks,
        )))
    }

    fn embed_crop(&self, crop: &DynamicImage) -> Result<Vec<f32>, RecognitionError> {
        let input = image_to_chw(crop, EMBEDDER_SIDE);
        let input_value = Value::from_array((
            vec![1usize, 3, EMBEDDER_SIDE as usize, EMBEDDER_SIDE as usize],
            input,
        ))
        .map_err(|e| RecognitionError::internal(format!("embedder input: {}", e)))?;

        let mut session = self
            .embedder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session
            .run(inputs![input_value])
            .map_err(|e| RecognitionError::internal(format!("embedder inference: {}", e)))?;

        let descriptor = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognitionError::internal(format!("embedder output: {}", e)))?
            .1
            .to_vec();

        if descriptor.len() != DESCRIPTOR_DIM {
            return Err(RecognitionError::internal(format!(
                "embedder produced {} dims, expected {}",
                descriptor.len(),
                DESCRIPTOR_DIM
            )));
        }
        Ok(descriptor)
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect_and_embed(
        &self,
        image: &[u8],
        mode: DetectionMode,
    ) -> Result<FaceObservation, RecognitionError> {
        let img = decode_image(image)?;
        let floor = self.profile.floor(mode);

        let Some((bounding_box, detection_score, has_landmarks)) = self.detect(&img, floor)?
        else {
            return Err(RecognitionError::NoFace);
        };

        let crop = img.crop_imm(
            bounding_box.x,
            bounding_box.y,
            bounding_box.width,
            bounding_box.height,
        );
        let descriptor = self.embed_crop(&crop)?;

        Ok(FaceObservation {
            descriptor,
            bounding_box,
            detection_score,
            has_landmarks,
        })
    }

    fn warmup(&self) -> Result<(), RecognitionError> {
        let blank = DynamicImage::new_rgb8(DETECTOR_SIDE, DETECTOR_SIDE);
        // NoFace on a blank frame is the expected outcome; only backend
        // failures count as a failed warmup.
        match self.detect(&blank, 0.99) {
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        let crop = DynamicImage::new_rgb8(EMBEDDER_SIDE, EMBEDDER_SIDE);
        self.embed_crop(&crop).map(|_| ())
    }
}

/// Resize to a square and lay out as normalized CHW f32.
fn image_to_chw(img: &DynamicImage, side: u32) -> Vec<f32> {
    let resized = img
        .resize_exact(side, side, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let pixels = (side * side) as usize;
    let mut out = vec![0.0f32; pixels * 3];
    for (i, pixel) in resized.pixels().enumerate() {
        out[i] = pixel.0[0] as f32 / 255.0;
        out[pixels + i] = pixel.0[1] as f32 / 255.0;
        out[2 * pixels + i] = pixel.0[2] as f32 / 255.0;
    }
    out
}

/// Deterministic embedder for tests and offline tooling.
///
/// Derives the descriptor from a digest of the image bytes, so identical
/// bytes always map to the same point and distinct images land far apart
/// (unit-sphere random vectors in 128-D concentrate around distance √2).
/// Image validation matches the real adapter.
pub struct StubEmbedder;

impl FaceEmbedder for StubEmbedder {
    fn detect_and_embed(
        &self,
        image: &[u8],
        _mode: DetectionMode,
    ) -> Result<FaceObservation, RecognitionError> {
        use md5::{Digest, Md5};
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let img = decode_image(image)?;

        let digest = Md5::digest(image);
        let seed = u64::from_le_bytes(digest[0..8].try_into().expect("md5 is 16 bytes"));
        let mut rng = StdRng::seed_from_u64(seed);

        let raw: Vec<f32> = (0..DESCRIPTOR_DIM).map(|_| rng.gen::<f32>() - 0.5).collect();
        let descriptor = visage_core::l2_normalized(&raw);

        let side = (img.width().min(img.height())) / 2;
        Ok(FaceObservation {
            descriptor,
            bounding_box: FaceBox {
                x: img.width() / 4,
                y: img.height() / 4,
                width: side,
                height: side,
            },
            detection_score: 0.99,
            has_landmarks: true,
        })
    }

    fn warmup(&self) -> Result<(), RecognitionError> {
        Ok(())
    }
}
