use std::time::Duration;

use serde::Deserialize;

/// Tunable options the pipeline consumes.
///
/// Loading (files, environment) is the embedding application's concern; the
/// core only sees resolved values. Thresholds default to the values the
/// system was tuned with, but none of them is a constant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Detections below this confidence are discarded inside the detector,
    /// so callers never see low-confidence noise.
    pub min_detection_confidence: f32,
    /// Minimum bounding-box area as a fraction of frame area.
    pub min_face_size_ratio: f32,
    /// Minimum Laplacian variance over the face crop.
    pub blur_threshold: f32,
    /// Maximum absolute roll/yaw deviation in degrees.
    pub pose_limit_degrees: f32,
    /// Acceptable mean-brightness window (0–255) for the face crop.
    pub lighting_range: (f32, f32),
    /// Minimum brightness standard deviation for the face crop.
    pub min_contrast: f32,
    /// Maximum match distance for a positive identification.
    pub accept_threshold: f32,
    /// Gap the second-best distinct identity must trail the best by for an
    /// unambiguous accept.
    pub ambiguity_margin: f32,
    /// Accepted captures required before an enrollment commits.
    pub enrollment_sample_count: usize,
    /// Enrollment session inactivity window in seconds.
    pub enrollment_timeout_secs: u64,
    /// Version tag stamped on every produced embedding.
    pub encoder_version: String,
    /// Detected regions tried per frame before giving up on quality.
    pub max_candidates_per_frame: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_detection_confidence: 0.5,
            min_face_size_ratio: 0.01,
            blur_threshold: 100.0,
            pose_limit_degrees: 30.0,
            lighting_range: (30.0, 220.0),
            min_contrast: 15.0,
            accept_threshold: 0.6,
            ambiguity_margin: 0.1,
            enrollment_sample_count: 5,
            enrollment_timeout_secs: 30,
            encoder_version: "w600k_r50".to_string(),
            max_candidates_per_frame: 10,
        }
    }
}

impl PipelineConfig {
    pub fn enrollment_timeout(&self) -> Duration {
        Duration::from_secs(self.enrollment_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = PipelineConfig::default();
        assert!(config.min_detection_confidence > 0.0);
        assert!(config.lighting_range.0 < config.lighting_range.1);
        assert!(config.ambiguity_margin < config.accept_threshold);
        assert!(config.enrollment_sample_count >= 1);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"accept_threshold": 0.45, "enrollment_sample_count": 3}"#)
                .unwrap();
        assert_eq!(config.accept_threshold, 0.45);
        assert_eq!(config.enrollment_sample_count, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.blur_threshold, 100.0);
        assert_eq!(config.encoder_version, "w600k_r50");
    }

    #[test]
    fn test_enrollment_timeout_duration() {
        let config = PipelineConfig { enrollment_timeout_secs: 7, ..Default::default() };
        assert_eq!(config.enrollment_timeout(), Duration::from_secs(7));
    }
}
