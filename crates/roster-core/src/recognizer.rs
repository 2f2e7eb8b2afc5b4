//! ArcFace (w600k_r50) embedding extraction.
//!
//! Input is the 112×112 crop produced by [`crate::alignment::align_face`];
//! output is a 512-float vector scaled to unit length.

use std::path::Path;

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use crate::alignment::ALIGNED_SIZE;
use crate::onnx::{self, ModelError};
use crate::types::Embedding;

pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Pixel value mapped to 0.0; also the divisor, so inputs land in [-1, 1].
const PIXEL_CENTER: f32 = 127.5;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        let session = onnx::open_session(model_path)?;
        tracing::info!(path = %model_path.display(), "ArcFace model ready");
        Ok(Self { session })
    }

    /// Embed an aligned face crop.
    pub fn extract(&mut self, crop: &RgbImage) -> Result<Embedding, ModelError> {
        let input = to_tensor(crop);

        let values = onnx::infer(&mut self.session, &input, |outputs| {
            let raw = onnx::f32_output(outputs, 0, "embedding")?;
            if raw.len() != ARCFACE_EMBEDDING_DIM {
                return Err(ModelError::BadOutput(format!(
                    "embedding has {} values, want {ARCFACE_EMBEDDING_DIM}",
                    raw.len()
                )));
            }
            Ok(unit_length(raw))
        })?;

        Ok(Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// 1×3×112×112 planar tensor, channels in R, G, B order.
fn to_tensor(crop: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        match crop.get_pixel_checked(x as u32, y as u32) {
            Some(p) => (p[c] as f32 - PIXEL_CENTER) / PIXEL_CENTER,
            None => 0.0,
        }
    })
}

fn unit_length(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|x| x / norm).collect()
}
