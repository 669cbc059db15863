//! Face detection: the capability trait and an SCRFD adapter via ONNX
//! Runtime, with 3-stride anchor-free decoding and NMS post-processing.

use std::path::Path;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::raster::{resize_bilinear, GrayBuf};
use crate::types::{FaceRegion, Frame};

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a frame.
///
/// Implementations return regions sorted by descending confidence, with
/// candidates below the configured confidence floor already discarded so the
/// caller never special-cases low-confidence noise. An empty vec is the
/// normal no-face outcome, never an error. Detection is deterministic for a
/// given frame and model.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Structural soundness check before a frame reaches any model.
pub(crate) fn validate_frame(frame: &Frame) -> Result<(), DetectorError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(DetectorError::InvalidFrame(format!(
            "zero dimensions ({}x{})",
            frame.width, frame.height
        )));
    }
    if frame.data.len() < frame.expected_len() {
        return Err(DetectorError::InvalidFrame(format!(
            "pixel buffer holds {} bytes, layout requires {}",
            frame.data.len(),
            frame.expected_len()
        )));
    }
    Ok(())
}

/// Mapping between the letterboxed model input and frame coordinates.
#[derive(Debug)]
struct Viewport {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    content_w: usize,
    content_h: usize,
}

impl Viewport {
    /// Fit a frame into a square model input, preserving aspect ratio.
    fn fit(frame_w: usize, frame_h: usize, input: usize) -> Self {
        let scale = (input as f32 / frame_w as f32).min(input as f32 / frame_h as f32);
        let content_w = (frame_w as f32 * scale).round() as usize;
        let content_h = (frame_h as f32 * scale).round() as usize;
        Self {
            scale,
            pad_x: (input - content_w) as f32 / 2.0,
            pad_y: (input - content_h) as f32 / 2.0,
            content_w,
            content_h,
        }
    }

    /// Map a point from model-input space back into frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (scores, boxes, keypoints).
type SlotIndices = (usize, usize, usize);

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their tensors ("score_8", "bbox_16", "kps_32")
/// or use opaque numeric names. Named exports are mapped per stride; anything
/// else falls back to the standard positional layout
/// [scores 8/16/32, boxes 8/16/32, kps 8/16/32].
fn map_output_slots(names: &[String]) -> [SlotIndices; 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| n == &format!("{prefix}_{stride}"));

    let fully_named = SCRFD_STRIDES.iter().all(|&s| {
        find("score", s).is_some() && find("bbox", s).is_some() && find("kps", s).is_some()
    });

    if fully_named {
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (
                find("score", stride).unwrap(),
                find("bbox", stride).unwrap(),
                find("kps", stride).unwrap(),
            )
        })
    } else {
        tracing::info!(?names, "unrecognized detector output names, using positional layout");
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    min_confidence: f32,
    input_size: usize,
    slots: [SlotIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model. `min_confidence` is the detection floor,
    /// normally `PipelineConfig::min_detection_confidence`.
    pub fn load(model_path: &str, min_confidence: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }
        let slots = map_output_slots(&output_names);

        tracing::info!(
            path = model_path,
            min_confidence,
            outputs = ?output_names,
            "loaded face detection model"
        );

        Ok(Self { session, min_confidence, input_size: SCRFD_INPUT_SIZE, slots })
    }

    /// Letterbox the grayscale frame into a normalized NCHW tensor. Padding
    /// uses the model mean so it normalizes to zero.
    fn preprocess(&self, gray: &GrayBuf) -> (Array4<f32>, Viewport) {
        let viewport = Viewport::fit(gray.width, gray.height, self.input_size);
        let resized = resize_bilinear(gray, viewport.content_w, viewport.content_h);

        let x_off = viewport.pad_x.floor() as usize;
        let y_off = viewport.pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_size, self.input_size));

        for y in 0..self.input_size {
            for x in 0..self.input_size {
                let inside = y >= y_off
                    && y < y_off + viewport.content_h
                    && x >= x_off
                    && x < x_off + viewport.content_w;
                let pixel = if inside {
                    resized.data[(y - y_off) * viewport.content_w + (x - x_off)] as f32
                } else {
                    SCRFD_MEAN
                };
                let value = (pixel - SCRFD_MEAN) / SCRFD_STD;
                // Grayscale replicated across the three input channels.
                tensor[[0, 0, y, x]] = value;
                tensor[[0, 1, y, x]] = value;
                tensor[[0, 2, y, x]] = value;
            }
        }

        (tensor, viewport)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectorError> {
        validate_frame(frame)?;

        let gray = GrayBuf {
            data: frame.to_gray().into_owned(),
            width: frame.width as usize,
            height: frame.height as usize,
        };
        let (input, viewport) = self.preprocess(&gray);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, box_idx, kps_idx) = self.slots[slot];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[box_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                boxes,
                kps,
                stride,
                self.input_size,
                &viewport,
                self.min_confidence,
            ));
        }

        let mut regions = suppress_overlaps(candidates, SCRFD_NMS_IOU);
        regions.sort_by(|a, b| {
            b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(
            faces = regions.len(),
            source = %frame.source_id,
            seq = frame.sequence,
            "detection complete"
        );
        Ok(regions)
    }
}

/// Decode one stride level's anchor grid into frame-space regions.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    viewport: &Viewport,
    floor: f32,
) -> Vec<FaceRegion> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let mut out = Vec::new();

    for idx in 0..anchors {
        let Some(&score) = scores.get(idx) else { break };
        if score < floor {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid * stride) as f32;
        let anchor_y = (cell / grid * stride) as f32;

        // Box offsets are [left, top, right, bottom] distances in stride units.
        let b = idx * 4;
        if b + 3 >= boxes.len() {
            continue;
        }
        let (x1, y1) = viewport.to_frame(
            anchor_x - boxes[b] * stride as f32,
            anchor_y - boxes[b + 1] * stride as f32,
        );
        let (x2, y2) = viewport.to_frame(
            anchor_x + boxes[b + 2] * stride as f32,
            anchor_y + boxes[b + 3] * stride as f32,
        );

        let k = idx * 10;
        let landmarks = (k + 9 < kps.len()).then(|| {
            let mut points = [(0.0f32, 0.0f32); 5];
            for (i, point) in points.iter_mut().enumerate() {
                *point = viewport.to_frame(
                    anchor_x + kps[k + i * 2] * stride as f32,
                    anchor_y + kps[k + i * 2 + 1] * stride as f32,
                );
            }
            points
        });

        out.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    out
}

/// Greedy non-maximum suppression by IoU.
fn suppress_overlaps(mut candidates: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| {
        b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<FaceRegion> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-union of two regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
