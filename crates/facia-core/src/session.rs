use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::types::Embedding;

/// Cooperative cancellation flag, checked between pipeline stages. A single
/// in-progress model inference is never interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    TimedOut,
}

/// Accumulates accepted captures for one enrollment.
///
/// The caller holds the session and passes it into every capture call, so
/// the orchestrator itself stays stateless and shareable. Dropping a session
/// before commit discards everything it gathered. A session that committed
/// or timed out accepts no further captures.
pub struct EnrollmentSession {
    id: String,
    label: String,
    required: usize,
    timeout: Duration,
    accepted: Vec<Embedding>,
    last_activity: Instant,
    state: SessionState,
}

impl EnrollmentSession {
    pub fn new(label: impl Into<String>, required: usize, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            required: required.max(1),
            timeout,
            accepted: Vec::new(),
            last_activity: Instant::now(),
            state: SessionState::Open,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn captured(&self) -> usize {
        self.accepted.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_complete(&self) -> bool {
        self.accepted.len() >= self.required
    }

    /// True once the inactivity window has elapsed since the last capture
    /// attempt.
    pub fn is_expired(&self) -> bool {
        self.state == SessionState::Open && self.last_activity.elapsed() > self.timeout
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn push(&mut self, embedding: Embedding) {
        self.accepted.push(embedding);
    }

    pub(crate) fn mark_timed_out(&mut self) {
        self.state = SessionState::TimedOut;
    }

    /// Take the accepted embeddings for commit, closing the session.
    pub(crate) fn take_accepted(&mut self) -> Vec<Embedding> {
        self.state = SessionState::Committed;
        std::mem::take(&mut self.accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_session_counts_toward_required() {
        let mut session = EnrollmentSession::new("alice", 3, Duration::from_secs(30));
        assert!(!session.is_complete());
        session.push(Embedding::new(vec![0.0], "v1"));
        session.push(Embedding::new(vec![0.0], "v1"));
        assert_eq!(session.captured(), 2);
        assert!(!session.is_complete());
        session.push(Embedding::new(vec![0.0], "v1"));
        assert!(session.is_complete());
    }

    #[test]
    fn test_take_accepted_closes_session() {
        let mut session = EnrollmentSession::new("alice", 1, Duration::from_secs(30));
        session.push(Embedding::new(vec![1.0], "v1"));
        let taken = session.take_accepted();
        assert_eq!(taken.len(), 1);
        assert!(!session.is_open());
        assert_eq!(session.captured(), 0);
    }

    #[test]
    fn test_expiry_after_inactivity() {
        let mut session = EnrollmentSession::new("alice", 3, Duration::from_millis(25));
        std::thread::sleep(Duration::from_millis(60));
        assert!(session.is_expired());
        session.touch();
        assert!(!session.is_expired());
    }

    #[test]
    fn test_required_is_at_least_one() {
        let session = EnrollmentSession::new("alice", 0, Duration::from_secs(1));
        assert_eq!(session.required(), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = EnrollmentSession::new("x", 1, Duration::from_secs(1));
        let b = EnrollmentSession::new("x", 1, Duration::from_secs(1));
        assert_ne!(a.id(), b.id());
    }
}
