use std::path::{Path, PathBuf};

use anyhow::Context;
use facia_core::PipelineConfig;
use serde::Deserialize;

/// Process-level configuration: paths and timeouts around the pipeline
/// options. Loaded from an optional TOML file with `FACIA_*` environment
/// overrides on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database holding identities and the access log.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Timeout for one engine operation in seconds.
    pub op_timeout_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facia");

        Self {
            db_path: data_dir.join("identities.db"),
            model_dir: data_dir.join("models"),
            op_timeout_secs: 10,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the configuration: the TOML file named by `FACIA_CONFIG` (if
    /// set) overlaid with individual `FACIA_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("FACIA_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Some(path) = env_path("FACIA_DB_PATH") {
            self.db_path = path;
        }
        if let Some(path) = env_path("FACIA_MODEL_DIR") {
            self.model_dir = path;
        }
        if let Some(v) = env_u64("FACIA_OP_TIMEOUT_SECS") {
            self.op_timeout_secs = v;
        }
        if let Some(v) = env_f32("FACIA_MIN_DETECTION_CONFIDENCE") {
            self.pipeline.min_detection_confidence = v;
        }
        if let Some(v) = env_f32("FACIA_ACCEPT_THRESHOLD") {
            self.pipeline.accept_threshold = v;
        }
        if let Some(v) = env_f32("FACIA_AMBIGUITY_MARGIN") {
            self.pipeline.ambiguity_margin = v;
        }
        if let Some(v) = env_usize("FACIA_ENROLL_SAMPLES") {
            self.pipeline.enrollment_sample_count = v;
        }
        if let Some(v) = env_u64("FACIA_ENROLL_TIMEOUT_SECS") {
            self.pipeline.enrollment_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("FACIA_ENCODER_VERSION") {
            self.pipeline.encoder_version = v;
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the face encoder model.
    pub fn encoder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
