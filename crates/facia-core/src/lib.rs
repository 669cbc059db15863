//! facia-core — face identification pipeline.
//!
//! Frames flow detect → quality gate → encode → match against an in-memory
//! gallery of enrolled embeddings; enrollment reuses the same stages and
//! writes to the identity store instead. Detection and encoding sit behind
//! capability traits with SCRFD / ArcFace-style ONNX adapters as the default
//! implementations.

pub mod config;
pub mod detect;
pub mod encode;
pub mod gallery;
pub mod quality;
mod raster;
pub mod recognize;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

pub use config::PipelineConfig;
pub use detect::{DetectorError, FaceDetector, ScrfdDetector};
pub use encode::{ArcFaceEncoder, EncoderError, FaceEncoder};
pub use gallery::{Gallery, GalleryError, Neighbor};
pub use quality::QualityValidator;
pub use recognize::{EnrollProgress, IdentifyOutcome, PipelineError, Recognizer};
pub use session::{CancelToken, EnrollmentSession};
pub use source::{FrameSource, ImageSetSource, SourceError};
pub use store::{EnrolledEmbedding, IdentityStore, StoreError};
pub use types::{
    Decision, Embedding, FaceRegion, Frame, Identity, MatchCandidate, MatchResult, PixelLayout,
    QualityIssue, QualityReport,
};
