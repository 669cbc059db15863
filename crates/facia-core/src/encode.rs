//! Face encoding: the capability trait and an ArcFace-style ONNX adapter
//! that turns a quality-passed face region into a fixed-length embedding.

use std::path::Path;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::raster::{self, GrayBuf};
use crate::types::{Embedding, FaceRegion, Frame};

const ARCFACE_INPUT_SIZE: usize = 112;
// Symmetric normalization: (pixel - 127.5) / 127.5.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Extra context around the bounding box, as a fraction of its size.
const CROP_PAD_RATIO: f32 = 0.2;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("cannot encode region: {0}")]
    EncodingFailure(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an accepted face region to an embedding.
///
/// Pure: the same region yields the same vector, with no state carried
/// across calls. Every produced embedding carries the encoder's version
/// tag; vectors from different versions are never comparable.
pub trait FaceEncoder: Send {
    fn encode(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, EncoderError>;

    /// Version tag stamped on produced embeddings.
    fn version(&self) -> &str;
}

/// ArcFace-style face encoder.
pub struct ArcFaceEncoder {
    session: Session,
    version: String,
}

impl ArcFaceEncoder {
    /// Load the encoder ONNX model. `version` is the tag from
    /// `PipelineConfig::encoder_version`, stamped on every embedding.
    pub fn load(model_path: &str, version: impl Into<String>) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let version = version.into();
        tracing::info!(
            path = model_path,
            version = %version,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { session, version })
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, EncoderError> {
        if !frame.is_well_formed() {
            return Err(EncoderError::EncodingFailure("malformed source frame".into()));
        }

        let gray = frame.to_gray();
        let crop = raster::crop(
            &gray,
            frame.width as usize,
            frame.height as usize,
            padded_square(region),
        );
        if crop.is_empty() {
            return Err(EncoderError::EncodingFailure(format!(
                "region ({}, {}, {}x{}) lies outside the frame",
                region.x, region.y, region.width, region.height
            )));
        }

        let resized = raster::resize_bilinear(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE);
        let input = preprocess(&resized);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::EncodingFailure(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EncoderError::EncodingFailure(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw.to_vec()), self.version.clone()))
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Square crop rectangle centered on the region, padded by `CROP_PAD_RATIO`
/// of the larger box side. Clamping to the frame happens in the crop itself.
fn padded_square(region: &FaceRegion) -> (f32, f32, f32, f32) {
    let side = region.width.max(region.height) * (1.0 + 2.0 * CROP_PAD_RATIO);
    let cx = region.x + region.width / 2.0;
    let cy = region.y + region.height / 2.0;
    (cx - side / 2.0, cy - side / 2.0, side, side)
}

/// Expand a grayscale crop into a normalized NCHW tensor, replicating the
/// single channel across all three model inputs.
fn preprocess(aligned: &GrayBuf) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let pixel = aligned.data.get(y * size + x).copied().unwrap_or(0) as f32;
            let value = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 0, y, x]] = value;
            tensor[[0, 1, y, x]] = value;
            tensor[[0, 2, y, x]] = value;
        }
    }

    tensor
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|v| v / norm).collect()
    } else {
        values
    }
}
