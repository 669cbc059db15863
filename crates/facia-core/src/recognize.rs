//! Pipeline orchestration: detect → quality gate → encode → match/enroll.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::detect::{DetectorError, FaceDetector};
use crate::encode::{EncoderError, FaceEncoder};
use crate::gallery::{Gallery, GalleryError};
use crate::quality::QualityValidator;
use crate::session::{CancelToken, EnrollmentSession};
use crate::store::{IdentityStore, StoreError};
use crate::types::{Frame, Identity, MatchResult, QualityIssue};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("enrollment session {0} is closed")]
    SessionClosed(String),
}

/// Terminal outcome of one identify call. All of these occur in routine
/// operation and are ordinary values, not errors.
#[derive(Debug, Clone)]
pub enum IdentifyOutcome {
    /// The frame contained no detectable face.
    NoFace,
    /// Every tried candidate failed the quality gate; reasons are the
    /// deduplicated union across candidates.
    QualityRejected(Vec<QualityIssue>),
    /// A quality-passed face was encoded and matched against the gallery.
    Decided(MatchResult),
}

/// Result of the shared detect → gate → encode front half.
enum Probe {
    NoFace,
    QualityRejected(Vec<QualityIssue>),
    Embedded(crate::types::Embedding),
}

/// Progress of one enrollment capture.
#[derive(Debug, Clone)]
pub enum EnrollProgress {
    /// No face in this capture; it does not count, the session continues.
    NoFace,
    /// Capture rejected; it does not count, the session continues.
    Rejected(Vec<QualityIssue>),
    /// Capture accepted and accumulated.
    Accepted { captured: usize, required: usize },
    /// Enough captures accumulated: the identity is persisted and indexed.
    Committed { identity: Identity, embeddings: usize },
    /// The inactivity window elapsed; the session is closed and nothing was
    /// persisted.
    TimedOut,
}

/// Drives the pipeline for one worker.
///
/// Owns its model adapters (inference takes `&mut`); the gallery, the store
/// and the caller-held enrollment session carry all identity-affecting
/// state, so independent identify calls are stateless and workers can be
/// multiplied freely over a shared gallery.
pub struct Recognizer {
    detector: Box<dyn FaceDetector>,
    encoder: Box<dyn FaceEncoder>,
    validator: QualityValidator,
    gallery: Arc<Gallery>,
    store: Arc<dyn IdentityStore>,
    config: PipelineConfig,
}

impl Recognizer {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        encoder: Box<dyn FaceEncoder>,
        gallery: Arc<Gallery>,
        store: Arc<dyn IdentityStore>,
        config: PipelineConfig,
    ) -> Self {
        let validator = QualityValidator::new(&config);
        Self { detector, encoder, validator, gallery, store, config }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// New enrollment session sized from the configuration.
    pub fn start_enrollment(&self, label: impl Into<String>) -> EnrollmentSession {
        EnrollmentSession::new(
            label,
            self.config.enrollment_sample_count,
            self.config.enrollment_timeout(),
        )
    }

    /// Identify the subject in a frame against the gallery.
    pub fn identify(&mut self, frame: &Frame) -> Result<IdentifyOutcome, PipelineError> {
        self.identify_cancellable(frame, &CancelToken::new())
    }

    /// Identify, checking `cancel` between pipeline stages.
    pub fn identify_cancellable(
        &mut self,
        frame: &Frame,
        cancel: &CancelToken,
    ) -> Result<IdentifyOutcome, PipelineError> {
        match self.probe(frame, cancel)? {
            Probe::NoFace => Ok(IdentifyOutcome::NoFace),
            Probe::QualityRejected(issues) => Ok(IdentifyOutcome::QualityRejected(issues)),
            Probe::Embedded(embedding) => {
                check_cancel(cancel)?;
                let result = self.gallery.decide(&embedding)?;
                tracing::info!(
                    decision = ?result.decision,
                    best = result.best.as_ref().map(|c| c.identity_id.as_str()),
                    distance = result.best.as_ref().map(|c| c.distance),
                    source = %frame.source_id,
                    seq = frame.sequence,
                    "identify decided"
                );
                Ok(IdentifyOutcome::Decided(result))
            }
        }
    }

    /// Confirm a claimed identity (1:1) against its enrolled embeddings.
    pub fn verify(
        &mut self,
        frame: &Frame,
        identity_id: &str,
    ) -> Result<IdentifyOutcome, PipelineError> {
        self.verify_cancellable(frame, identity_id, &CancelToken::new())
    }

    /// Verify, checking `cancel` between pipeline stages.
    pub fn verify_cancellable(
        &mut self,
        frame: &Frame,
        identity_id: &str,
        cancel: &CancelToken,
    ) -> Result<IdentifyOutcome, PipelineError> {
        match self.probe(frame, cancel)? {
            Probe::NoFace => Ok(IdentifyOutcome::NoFace),
            Probe::QualityRejected(issues) => Ok(IdentifyOutcome::QualityRejected(issues)),
            Probe::Embedded(embedding) => {
                check_cancel(cancel)?;
                let result = self.gallery.verify(&embedding, identity_id)?;
                tracing::info!(
                    decision = ?result.decision,
                    claimed = identity_id,
                    distance = result.best.as_ref().map(|c| c.distance),
                    source = %frame.source_id,
                    seq = frame.sequence,
                    "verify decided"
                );
                Ok(IdentifyOutcome::Decided(result))
            }
        }
    }

    /// Shared front half of the pipeline: detect, then walk candidates in
    /// confidence order through the quality gate until one encodes.
    fn probe(&mut self, frame: &Frame, cancel: &CancelToken) -> Result<Probe, PipelineError> {
        check_cancel(cancel)?;

        let regions = self.detector.detect(frame)?;
        if regions.is_empty() {
            tracing::debug!(source = %frame.source_id, seq = frame.sequence, "no face detected");
            return Ok(Probe::NoFace);
        }
        check_cancel(cancel)?;

        let mut aggregated: Vec<QualityIssue> = Vec::new();
        for region in regions.iter().take(self.config.max_candidates_per_frame) {
            let report = self.validator.validate(frame, region);
            if !report.is_pass() {
                for issue in report.issues {
                    if !aggregated.contains(&issue) {
                        aggregated.push(issue);
                    }
                }
                continue;
            }

            check_cancel(cancel)?;
            let embedding = self.encoder.encode(frame, region)?;
            return Ok(Probe::Embedded(embedding));
        }

        tracing::debug!(
            reasons = ?aggregated,
            candidates = regions.len().min(self.config.max_candidates_per_frame),
            "all candidates failed quality gate"
        );
        Ok(Probe::QualityRejected(aggregated))
    }

    /// Feed one capture into an enrollment session.
    pub fn enroll_capture(
        &mut self,
        session: &mut EnrollmentSession,
        frame: &Frame,
    ) -> Result<EnrollProgress, PipelineError> {
        self.enroll_capture_cancellable(session, frame, &CancelToken::new())
    }

    /// Feed one capture into an enrollment session, checking `cancel`
    /// between stages. Enrollment is single-subject: a frame with several
    /// faces is unusable for it.
    pub fn enroll_capture_cancellable(
        &mut self,
        session: &mut EnrollmentSession,
        frame: &Frame,
        cancel: &CancelToken,
    ) -> Result<EnrollProgress, PipelineError> {
        if !session.is_open() {
            return Err(PipelineError::SessionClosed(session.id().to_string()));
        }
        if session.is_expired() {
            session.mark_timed_out();
            tracing::warn!(
                session = session.id(),
                captured = session.captured(),
                required = session.required(),
                "enrollment session timed out"
            );
            return Ok(EnrollProgress::TimedOut);
        }
        session.touch();
        check_cancel(cancel)?;

        let regions = self.detector.detect(frame)?;
        if regions.is_empty() {
            return Ok(EnrollProgress::NoFace);
        }
        if regions.len() > 1 {
            tracing::debug!(faces = regions.len(), "multiple faces during enrollment capture");
            return Ok(EnrollProgress::Rejected(vec![QualityIssue::MultipleFaces]));
        }

        let region = &regions[0];
        let report = self.validator.validate(frame, region);
        if !report.is_pass() {
            return Ok(EnrollProgress::Rejected(report.issues));
        }

        check_cancel(cancel)?;
        let embedding = self.encoder.encode(frame, region)?;
        session.push(embedding);
        tracing::info!(
            session = session.id(),
            captured = session.captured(),
            required = session.required(),
            "enrollment capture accepted"
        );

        if session.is_complete() {
            self.commit(session)
        } else {
            Ok(EnrollProgress::Accepted {
                captured: session.captured(),
                required: session.required(),
            })
        }
    }

    /// Persist the session as one identity with all accumulated embeddings
    /// and publish them to the gallery. The session is closed either way; a
    /// store failure is fatal for it.
    fn commit(&mut self, session: &mut EnrollmentSession) -> Result<EnrollProgress, PipelineError> {
        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            label: session.label().to_string(),
            enrolled_at: Utc::now(),
            encoder_version: self.encoder.version().to_string(),
        };
        let embeddings = session.take_accepted();

        self.store.persist_enrollment(&identity, &embeddings)?;
        for embedding in &embeddings {
            self.gallery.add(&identity.id, embedding.clone())?;
        }

        tracing::info!(
            identity = %identity.id,
            label = %identity.label,
            samples = embeddings.len(),
            "enrollment committed"
        );
        Ok(EnrollProgress::Committed { identity, embeddings: embeddings.len() })
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}
