//! Image bytes → face embedding.
//!
//! Decoding happens fully in memory with dimension and allocation limits;
//! the caller's buffer is never written anywhere.

use crate::alignment;
use crate::detector::FaceDetector;
use crate::onnx::ModelError;
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, Embedding};
use image::{ImageReader, Limits, RgbImage};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Largest accepted width or height of an uploaded image, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;
/// Upper bound on decoder allocations.
pub const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Produces at most one embedding per image.
pub trait FaceEncoder {
    fn encode(&mut self, image: &[u8]) -> Result<Embedding, EncodeError>;
}

/// Decode arbitrary image bytes into an RGB raster.
///
/// The format is sniffed from the content, not trusted from any filename.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EncodeError> {
    if bytes.is_empty() {
        return Err(EncodeError::Decode("empty image".into()));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| EncodeError::Decode(e.to_string()))?;
    reader.limits(limits);

    let image = reader.decode().map_err(|e| EncodeError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Pick the face to embed when several are present: the first detection,
/// i.e. highest confidence with ties in detector scan order.
pub fn select_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.first()
}

/// Canonical crop for the selected face.
///
/// A detection without landmarks, or with landmarks too degenerate to align,
/// counts as no usable face.
pub fn aligned_crop(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, EncodeError> {
    let landmarks = face.landmarks.as_ref().ok_or(EncodeError::NoFaceDetected)?;
    alignment::align_face(image, landmarks).ok_or_else(|| {
        tracing::warn!(confidence = face.confidence, "degenerate landmarks; skipping face");
        EncodeError::NoFaceDetected
    })
}

/// SCRFD detection + ArcFace recognition.
pub struct OnnxEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEncoder {
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, EncodeError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self { detector, recognizer })
    }

    /// Load both models from their standard file names inside `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self, EncodeError> {
        Self::load(&model_dir.join(SCRFD_MODEL_FILE), &model_dir.join(ARCFACE_MODEL_FILE))
    }
}

impl FaceEncoder for OnnxEncoder {
    fn encode(&mut self, image: &[u8]) -> Result<Embedding, EncodeError> {
        let rgb = decode_image(image)?;
        let faces = self.detector.detect(&rgb)?;
        let face = select_face(&faces).ok_or(EncodeError::NoFaceDetected)?;

        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            width = rgb.width(),
            height = rgb.height(),
            "encoding selected face"
        );

        let crop = aligned_crop(&rgb, face)?;
        Ok(self.recognizer.extract(&crop)?)
    }
}
