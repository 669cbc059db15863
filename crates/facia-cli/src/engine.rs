//! Engine worker: one dedicated OS thread owns the model sessions and the
//! recognizer, serving requests over a channel so frames stay in order per
//! stream. `EngineHandle` is clone-safe and async-friendly.

use std::sync::Arc;
use std::time::Duration;

use facia_core::{
    ArcFaceEncoder, EnrollProgress, Frame, Gallery, Identity, IdentifyOutcome, IdentityStore,
    PipelineError, Recognizer, ScrfdDetector,
};
use facia_store::SqliteStore;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::AppConfig;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of an enrollment run over a finite frame sequence.
#[derive(Debug)]
pub enum EnrollRun {
    Committed { identity: Identity, embeddings: usize, rejected: usize },
    TimedOut { captured: usize, required: usize },
    /// The frames ran out before enough captures were accepted.
    Exhausted { captured: usize, required: usize, rejected: usize },
}

enum EngineRequest {
    Identify {
        frame: Frame,
        reply: oneshot::Sender<Result<IdentifyOutcome, PipelineError>>,
    },
    Verify {
        frame: Frame,
        identity_id: String,
        reply: oneshot::Sender<Result<IdentifyOutcome, PipelineError>>,
    },
    Enroll {
        label: String,
        frames: Vec<Frame>,
        reply: oneshot::Sender<Result<EnrollRun, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread. Every operation is bounded by
/// the configured timeout; a single in-flight model inference is never
/// interrupted, the reply is simply abandoned.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    op_timeout: Duration,
}

impl EngineHandle {
    pub async fn identify(&self, frame: Frame) -> Result<IdentifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify { frame, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let outcome = tokio::time::timeout(self.op_timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.op_timeout))?
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(outcome?)
    }

    pub async fn verify(
        &self,
        frame: Frame,
        identity_id: String,
    ) -> Result<IdentifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify { frame, identity_id, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let outcome = tokio::time::timeout(self.op_timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.op_timeout))?
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(outcome?)
    }

    pub async fn enroll(&self, label: String, frames: Vec<Frame>) -> Result<EnrollRun, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { label, frames, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let run = tokio::time::timeout(self.op_timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.op_timeout))?
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(run?)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models and warms the gallery from the store before the
/// request loop starts, failing fast if any resource is unavailable.
pub fn spawn_engine(config: &AppConfig, store: Arc<SqliteStore>) -> anyhow::Result<EngineHandle> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(
        &detector_path.to_string_lossy(),
        config.pipeline.min_detection_confidence,
    )?;
    tracing::info!(path = %detector_path.display(), "face detector loaded");

    let encoder_path = config.encoder_model_path();
    let encoder =
        ArcFaceEncoder::load(&encoder_path.to_string_lossy(), config.pipeline.encoder_version.clone())?;
    tracing::info!(path = %encoder_path.display(), "face encoder loaded");

    let gallery = Arc::new(Gallery::new(&config.pipeline));
    let loaded = gallery.warm_start(store.as_ref())?;
    tracing::info!(embeddings = loaded, "gallery warmed from store");

    let mut recognizer = Recognizer::new(
        Box::new(detector),
        Box::new(encoder),
        gallery,
        store as Arc<dyn IdentityStore>,
        config.pipeline.clone(),
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facia-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    EngineRequest::Identify { frame, reply } => {
                        let _ = reply.send(recognizer.identify(&frame));
                    }
                    EngineRequest::Verify { frame, identity_id, reply } => {
                        let _ = reply.send(recognizer.verify(&frame, &identity_id));
                    }
                    EngineRequest::Enroll { label, frames, reply } => {
                        let _ = reply.send(run_enroll(&mut recognizer, &label, &frames));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| anyhow::anyhow!("failed to spawn engine thread: {e}"))?;

    Ok(EngineHandle { tx, op_timeout: Duration::from_secs(config.op_timeout_secs) })
}

/// Run one enrollment session over a finite sequence of frames.
fn run_enroll(
    recognizer: &mut Recognizer,
    label: &str,
    frames: &[Frame],
) -> Result<EnrollRun, PipelineError> {
    let mut session = recognizer.start_enrollment(label);
    let mut rejected = 0usize;

    for frame in frames {
        match recognizer.enroll_capture(&mut session, frame)? {
            EnrollProgress::Committed { identity, embeddings } => {
                return Ok(EnrollRun::Committed { identity, embeddings, rejected });
            }
            EnrollProgress::TimedOut => {
                return Ok(EnrollRun::TimedOut {
                    captured: session.captured(),
                    required: session.required(),
                });
            }
            EnrollProgress::Accepted { captured, required } => {
                tracing::info!(captured, required, "enrollment capture accepted");
            }
            EnrollProgress::Rejected(issues) => {
                rejected += 1;
                tracing::warn!(?issues, seq = frame.sequence, "enrollment capture rejected");
            }
            EnrollProgress::NoFace => {
                rejected += 1;
                tracing::warn!(seq = frame.sequence, "no face in enrollment capture");
            }
        }
    }

    Ok(EnrollRun::Exhausted {
        captured: session.captured(),
        required: session.required(),
        rejected,
    })
}
