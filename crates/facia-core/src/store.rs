use thiserror::Error;

use crate::types::{Embedding, Identity};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// One persisted embedding with its owning identity.
#[derive(Debug, Clone)]
pub struct EnrolledEmbedding {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// The narrow persistence contract the pipeline depends on.
///
/// Implementations live outside the core. Failures surface as-is and are
/// never retried here; an unavailable store means no matches, not stale
/// ones.
pub trait IdentityStore: Send + Sync {
    /// All persisted embeddings, for gallery warm-start.
    fn load_all_embeddings(&self) -> Result<Vec<EnrolledEmbedding>, StoreError>;

    /// Persist one identity together with its enrollment embeddings.
    fn persist_enrollment(
        &self,
        identity: &Identity,
        embeddings: &[Embedding],
    ) -> Result<(), StoreError>;

    /// Remove an identity and everything enrolled under it.
    fn delete_identity(&self, identity_id: &str) -> Result<(), StoreError>;
}
