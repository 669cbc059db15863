//! Pre-encoding quality gate.
//!
//! Embeddings are only meaningful for well-framed, sharp, frontal-ish faces;
//! garbage input degrades matching silently instead of failing loudly, so
//! every region is gated here before it may reach the encoder.

use crate::config::PipelineConfig;
use crate::raster;
use crate::types::{FaceRegion, Frame, QualityIssue, QualityReport};

/// Scores a detected face region against the acceptance criteria. Each
/// check gates and reports independently.
pub struct QualityValidator {
    min_face_size_ratio: f32,
    blur_threshold: f32,
    pose_limit_degrees: f32,
    lighting_range: (f32, f32),
    min_contrast: f32,
}

impl QualityValidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_face_size_ratio: config.min_face_size_ratio,
            blur_threshold: config.blur_threshold,
            pose_limit_degrees: config.pose_limit_degrees,
            lighting_range: config.lighting_range,
            min_contrast: config.min_contrast,
        }
    }

    pub fn validate(&self, frame: &Frame, region: &FaceRegion) -> QualityReport {
        let mut report = QualityReport::default();

        let frame_area = frame.width as f32 * frame.height as f32;
        report.size_ratio = if frame_area > 0.0 { region.area() / frame_area } else { 0.0 };
        if report.size_ratio < self.min_face_size_ratio {
            report.issues.push(QualityIssue::TooSmall);
        }

        let gray = frame.to_gray();
        let crop = raster::crop(
            &gray,
            frame.width as usize,
            frame.height as usize,
            (region.x, region.y, region.width, region.height),
        );

        report.sharpness = raster::laplacian_variance(&crop);
        if report.sharpness < self.blur_threshold {
            report.issues.push(QualityIssue::Blurry);
        }

        let (brightness, contrast) = raster::mean_stddev(&crop.data);
        report.brightness = brightness;
        report.contrast = contrast;
        let (lo, hi) = self.lighting_range;
        if !(lo..=hi).contains(&brightness) || contrast < self.min_contrast {
            report.issues.push(QualityIssue::PoorLighting);
        }

        match region.landmarks.as_ref() {
            Some(landmarks) => {
                let pose = pose_deviation(landmarks);
                report.pose_degrees = Some(pose);
                if pose > self.pose_limit_degrees {
                    report.issues.push(QualityIssue::ExtremePose);
                }
            }
            None => {
                // Pose cannot be estimated without landmarks; treat it as
                // acceptable rather than rejecting every landmark-less
                // detection.
                tracing::debug!(
                    source = %frame.source_id,
                    seq = frame.sequence,
                    "region has no landmarks, skipping pose check"
                );
            }
        }

        if !report.is_pass() {
            tracing::debug!(
                issues = ?report.issues,
                sharpness = report.sharpness,
                brightness = report.brightness,
                size_ratio = report.size_ratio,
                "face region failed quality gate"
            );
        }

        report
    }
}

/// Largest absolute pose deviation in degrees from five-point landmarks:
/// roll from the eye pair's tilt, yaw approximated from the nose tip's
/// horizontal offset relative to the interocular distance.
fn pose_deviation(landmarks: &[(f32, f32); 5]) -> f32 {
    let (left_eye, right_eye, nose) = (landmarks[0], landmarks[1], landmarks[2]);

    let dx = right_eye.0 - left_eye.0;
    let dy = right_eye.1 - left_eye.1;
    let roll = dy.atan2(dx).to_degrees();

    let interocular = (dx * dx + dy * dy).sqrt();
    let yaw = if interocular > 0.0 {
        let eye_mid_x = (left_eye.0 + right_eye.0) / 2.0;
        // A centered nose gives 0; a nose directly under either eye gives 45.
        ((nose.0 - eye_mid_x) / (interocular / 2.0)).atan().to_degrees()
    } else {
        0.0
    };

    roll.abs().max(yaw.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelLayout;
    use std::time::SystemTime;

    fn checkerboard_frame(width: u32, height: u32, low: u8, high: u8) -> Frame {
        let data = (0..(width * height) as usize)
            .map(|i| {
                let (x, y) = (i % width as usize, i / width as usize);
                if (x + y) % 2 == 0 { low } else { high }
            })
            .collect();
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

    fn flat_frame(width: u32, height: u32, shade: u8) -> Frame {
        Frame {
            data: vec![shade; (width * height) as usize],
            width,
            height,
            layout: PixelLayout::Gray8,
            timestamp: SystemTime::now(),
            source_id: "test".into(),
            sequence: 0,
        }
    }

    fn centered_region(w: f32, h: f32) -> FaceRegion {
        FaceRegion { x: 50.0, y: 50.0, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    fn validator() -> QualityValidator {
        QualityValidator::new(&PipelineConfig::default())
    }

    #[test]
    fn test_sharp_lit_face_passes() {
        // 60/140 checkerboard: mean 100, stddev 40, huge Laplacian variance.
        let frame = checkerboard_frame(200, 200, 60, 140);
        let report = validator().validate(&frame, &centered_region(100.0, 100.0));
        assert!(report.is_pass(), "issues: {:?}", report.issues);
        assert!(report.sharpness > 100.0);
        assert!(report.pose_degrees.is_none());
    }

    #[test]
    fn test_flat_crop_is_blurry_and_poorly_lit() {
        let frame = flat_frame(200, 200, 128);
        let report = validator().validate(&frame, &centered_region(100.0, 100.0));
        assert!(report.issues.contains(&QualityIssue::Blurry));
        // Mean 128 is in range but contrast is zero.
        assert!(report.issues.contains(&QualityIssue::PoorLighting));
    }

    #[test]
    fn test_dark_crop_fails_lighting() {
        let frame = checkerboard_frame(200, 200, 0, 20);
        let report = validator().validate(&frame, &centered_region(100.0, 100.0));
        assert!(report.issues.contains(&QualityIssue::PoorLighting));
        assert!(report.brightness < 30.0);
    }

    #[test]
    fn test_tiny_region_fails_size() {
        let frame = checkerboard_frame(200, 200, 60, 140);
        // 10x10 in a 200x200 frame: ratio 0.0025 < 0.01.
        let region =
            FaceRegion { x: 50.0, y: 50.0, width: 10.0, height: 10.0, confidence: 0.9, landmarks: None };
        let report = validator().validate(&frame, &region);
        assert!(report.issues.contains(&QualityIssue::TooSmall));
        assert!((report.size_ratio - 0.0025).abs() < 1e-6);
    }

    #[test]
    fn test_level_frontal_landmarks_pass_pose() {
        let frame = checkerboard_frame(200, 200, 60, 140);
        let mut region = centered_region(100.0, 100.0);
        // Level eyes, nose centered between them.
        region.landmarks = Some([(80.0, 90.0), (120.0, 90.0), (100.0, 110.0), (85.0, 130.0), (115.0, 130.0)]);
        let report = validator().validate(&frame, &region);
        assert!(report.is_pass(), "issues: {:?}", report.issues);
        assert!(report.pose_degrees.unwrap() < 1.0);
    }

    #[test]
    fn test_tilted_landmarks_fail_pose() {
        let frame = checkerboard_frame(200, 200, 60, 140);
        let mut region = centered_region(100.0, 100.0);
        // Eyes at 45 degrees of roll.
        region.landmarks = Some([(80.0, 80.0), (120.0, 120.0), (100.0, 110.0), (85.0, 130.0), (115.0, 130.0)]);
        let report = validator().validate(&frame, &region);
        assert!(report.issues.contains(&QualityIssue::ExtremePose));
        assert!((report.pose_degrees.unwrap() - 45.0).abs() < 1.0);
    }

    #[test]
    fn test_offset_nose_fails_pose() {
        let frame = checkerboard_frame(200, 200, 60, 140);
        let mut region = centered_region(100.0, 100.0);
        // Nose sitting on the right eye: strong yaw.
        region.landmarks = Some([(80.0, 90.0), (120.0, 90.0), (120.0, 110.0), (85.0, 130.0), (115.0, 130.0)]);
        let report = validator().validate(&frame, &region);
        assert!(report.issues.contains(&QualityIssue::ExtremePose));
    }

    #[test]
    fn test_independent_reporting_accumulates_issues() {
        // Tiny and flat and dark: three independent failures.
        let frame = flat_frame(200, 200, 10);
        let region =
            FaceRegion { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9, landmarks: None };
        let report = validator().validate(&frame, &region);
        assert!(report.issues.contains(&QualityIssue::TooSmall));
        assert!(report.issues.contains(&QualityIssue::Blurry));
        assert!(report.issues.contains(&QualityIssue::PoorLighting));
    }
}
