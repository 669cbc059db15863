use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::types::{Frame, PixelLayout};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to load {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("source cannot be restarted")]
    NotRestartable,
}

/// A lazy sequence of frames.
///
/// Live devices yield an unbounded, non-restartable stream; static image
/// sets are finite and restartable. `Ok(None)` is the end-of-stream signal,
/// not an error. Implementations own their device handle and release it on
/// drop, whatever the exit path.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Whether `restart` rewinds this source to its first frame.
    fn restartable(&self) -> bool {
        false
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        Err(SourceError::NotRestartable)
    }
}

/// Finite, restartable source over a fixed list of image files.
///
/// Frames are decoded to Gray8 on demand; the sequence counter keeps
/// increasing across restarts since every yield is a new sample.
pub struct ImageSetSource {
    source_id: String,
    paths: Vec<PathBuf>,
    cursor: usize,
    sequence: u64,
}

impl ImageSetSource {
    pub fn new(source_id: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self { source_id: source_id.into(), paths, cursor: 0, sequence: 0 }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSetSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(None);
        };

        let img = image::open(path).map_err(|source| SourceError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();

        self.cursor += 1;
        self.sequence += 1;
        tracing::debug!(path = %path.display(), width, height, "decoded frame");

        Ok(Some(Frame {
            data: gray.into_raw(),
            width,
            height,
            layout: PixelLayout::Gray8,
            timestamp: SystemTime::now(),
            source_id: self.source_id.clone(),
            sequence: self.sequence,
        }))
    }

    fn restartable(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }
}
