use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit grayscale, 1 byte per pixel.
    Gray8,
    /// Packed RGB, 3 bytes per pixel.
    Rgb8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// A single image sample handed to the pipeline.
///
/// Immutable once produced; the source that created it assigns `source_id`
/// and a monotonically increasing `sequence`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub timestamp: SystemTime,
    pub source_id: String,
    pub sequence: u64,
}

impl Frame {
    /// Buffer length the declared dimensions and layout require.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }

    /// Non-zero dimensions and a buffer at least as long as the layout needs.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= self.expected_len()
    }

    /// Grayscale view of the pixel data.
    ///
    /// Gray8 frames are borrowed as-is; Rgb8 frames are converted through an
    /// integer BT.601 luma approximation.
    pub fn to_gray(&self) -> Cow<'_, [u8]> {
        match self.layout {
            PixelLayout::Gray8 => Cow::Borrowed(&self.data[..self.expected_len()]),
            PixelLayout::Rgb8 => {
                let pixels = self.width as usize * self.height as usize;
                let mut gray = Vec::with_capacity(pixels);
                for rgb in self.data[..pixels * 3].chunks_exact(3) {
                    let (r, g, b) = (rgb[0] as u32, rgb[1] as u32, rgb[2] as u32);
                    gray.push(((77 * r + 150 * g + 29 * b) >> 8) as u8);
                }
                Cow::Owned(gray)
            }
        }
    }
}

/// A detected face within a frame, with optional five-point landmarks
/// `[left_eye, right_eye, nose, left_mouth, right_mouth]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// A single cause for rejecting a face capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    TooSmall,
    Blurry,
    ExtremePose,
    PoorLighting,
    MultipleFaces,
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityIssue::TooSmall => "too-small",
            QualityIssue::Blurry => "blurry",
            QualityIssue::ExtremePose => "extreme-pose",
            QualityIssue::PoorLighting => "poor-lighting",
            QualityIssue::MultipleFaces => "multiple-faces",
        };
        f.write_str(s)
    }
}

/// Verdict for one face region. An empty issue set is a pass; any issue
/// means the region must not reach the encoder.
#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    pub issues: Vec<QualityIssue>,
    /// Bounding-box area over frame area.
    pub size_ratio: f32,
    /// Laplacian variance over the face crop.
    pub sharpness: f32,
    /// Mean brightness of the face crop (0–255).
    pub brightness: f32,
    /// Brightness standard deviation of the face crop.
    pub contrast: f32,
    /// Largest absolute pose deviation in degrees, when landmarks allowed
    /// estimating one.
    pub pose_degrees: Option<f32>,
}

impl QualityReport {
    pub fn is_pass(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Fixed-length face descriptor.
///
/// The encoder version tag travels with every vector; embeddings from
/// different versions are never comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub version: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, version: impl Into<String>) -> Self {
        Self { values, version: version.into() }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance. Vectors of different lengths are incomparable and
    /// yield infinity, so they can never win a nearest-neighbor search.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub label: String,
    pub enrolled_at: DateTime<Utc>,
    pub encoder_version: String,
}

/// Identify decision for a probe embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Ambiguous,
    Rejected,
}

/// One enrolled identity at some distance from the probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: String,
    pub distance: f32,
}

/// Outcome of matching a probe embedding against the gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub decision: Decision,
    /// Closest enrolled identity, present whenever the gallery holds any
    /// entry. The decision says whether it was close enough.
    pub best: Option<MatchCandidate>,
    /// Distinct identities within the ambiguity margin of the best match.
    /// Populated only for ambiguous decisions.
    pub runners_up: Vec<MatchCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            layout: PixelLayout::Gray8,
            timestamp: SystemTime::now(),
            source_id: "test".into(),
            sequence: 0,
        }
    }

    #[test]
    fn test_well_formed_gray_frame() {
        let frame = gray_frame(vec![0u8; 12], 4, 3);
        assert!(frame.is_well_formed());
    }

    #[test]
    fn test_zero_dimension_frame_is_malformed() {
        let frame = gray_frame(vec![], 0, 3);
        assert!(!frame.is_well_formed());
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let frame = gray_frame(vec![0u8; 11], 4, 3);
        assert!(!frame.is_well_formed());
    }

    #[test]
    fn test_to_gray_borrows_gray8() {
        let frame = gray_frame(vec![10, 20, 30, 40], 2, 2);
        match frame.to_gray() {
            Cow::Borrowed(slice) => assert_eq!(slice, &[10, 20, 30, 40]),
            Cow::Owned(_) => panic!("Gray8 should borrow"),
        }
    }

    #[test]
    fn test_to_gray_converts_rgb() {
        // Pure red, green, blue, white pixels in a 2x2 RGB frame.
        let frame = Frame {
            data: vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255],
            width: 2,
            height: 2,
            layout: PixelLayout::Rgb8,
            timestamp: SystemTime::now(),
            source_id: "test".into(),
            sequence: 0,
        };
        let gray = frame.to_gray();
        // Integer BT.601: r=76, g=149, b=28, white=255.
        assert_eq!(gray[0], (77 * 255 >> 8) as u8);
        assert_eq!(gray[1], (150 * 255 >> 8) as u8);
        assert_eq!(gray[2], (29 * 255 >> 8) as u8);
        assert_eq!(gray[3], ((77 + 150 + 29) * 255 >> 8) as u8);
    }

    #[test]
    fn test_distance_identical_vectors() {
        let a = Embedding::new(vec![0.5, -0.25, 1.0], "v1");
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0], "v1");
        let b = Embedding::new(vec![3.0, 4.0], "v1");
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch_is_infinite() {
        let a = Embedding::new(vec![1.0, 2.0], "v1");
        let b = Embedding::new(vec![1.0, 2.0, 3.0], "v1");
        assert!(a.distance(&b).is_infinite());
    }

    #[test]
    fn test_quality_report_pass() {
        let mut report = QualityReport::default();
        assert!(report.is_pass());
        report.issues.push(QualityIssue::Blurry);
        assert!(!report.is_pass());
    }

    #[test]
    fn test_quality_issue_display() {
        assert_eq!(QualityIssue::ExtremePose.to_string(), "extreme-pose");
        assert_eq!(QualityIssue::MultipleFaces.to_string(), "multiple-faces");
    }
}
