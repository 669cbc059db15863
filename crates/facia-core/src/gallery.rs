//! In-memory nearest-neighbor index over enrolled embeddings.
//!
//! The distance metric is Euclidean, fixed for the whole index. Writers
//! rebuild the entry list and publish it as a fresh snapshot; readers clone
//! the current `Arc` and work on it unaffected by concurrent writes, which
//! become visible only to reads that start after the swap.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::store::{IdentityStore, StoreError};
use crate::types::{Decision, Embedding, MatchCandidate, MatchResult};

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("encoder version mismatch: gallery holds {expected:?}, embedding is {actual:?}")]
    EncoderVersionMismatch { expected: String, actual: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One enrolled embedding inside a snapshot.
#[derive(Debug, Clone)]
struct Entry {
    identity_id: String,
    embedding: Embedding,
}

#[derive(Debug, Default)]
struct Snapshot {
    entries: Vec<Entry>,
}

/// A gallery hit: an enrolled identity's embedding at some distance from
/// the probe.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub identity_id: String,
    pub distance: f32,
}

/// Matching index over `(identity, embedding, encoder version)` tuples.
///
/// Holds a read-through cache of the identity store's embeddings; the store
/// remains the system of record. All entries share one encoder version;
/// mismatched embeddings are rejected at the boundary rather than silently
/// compared.
pub struct Gallery {
    snapshot: RwLock<Arc<Snapshot>>,
    encoder_version: String,
    accept_threshold: f32,
    ambiguity_margin: f32,
}

impl Gallery {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            encoder_version: config.encoder_version.clone(),
            accept_threshold: config.accept_threshold,
            ambiguity_margin: config.ambiguity_margin,
        }
    }

    pub fn encoder_version(&self) -> &str {
        &self.encoder_version
    }

    /// Number of embeddings currently indexed.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Number of distinct identities currently indexed.
    pub fn identity_count(&self) -> usize {
        let snapshot = self.read();
        let mut ids: Vec<&str> = snapshot.entries.iter().map(|e| e.identity_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    fn read(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn verify_version(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.version != self.encoder_version {
            return Err(GalleryError::EncoderVersionMismatch {
                expected: self.encoder_version.clone(),
                actual: embedding.version.clone(),
            });
        }
        Ok(())
    }

    /// Rebuild the index from the identity store.
    ///
    /// Embeddings carrying a different encoder version are dropped with a
    /// warning; they must never reach a distance comparison. Returns the
    /// number of entries loaded.
    pub fn warm_start(&self, store: &dyn IdentityStore) -> Result<usize, GalleryError> {
        let rows = store.load_all_embeddings()?;
        let total = rows.len();

        let mut entries = Vec::with_capacity(total);
        for row in rows {
            if row.embedding.version != self.encoder_version {
                tracing::warn!(
                    identity = %row.identity_id,
                    version = %row.embedding.version,
                    expected = %self.encoder_version,
                    "skipping embedding with mismatched encoder version"
                );
                continue;
            }
            entries.push(Entry { identity_id: row.identity_id, embedding: row.embedding });
        }

        let loaded = entries.len();
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(Snapshot { entries });
        drop(guard);

        tracing::info!(loaded, skipped = total - loaded, "gallery warm start complete");
        Ok(loaded)
    }

    /// Insert an embedding for an identity. Idempotent per
    /// `(identity, embedding)` pair: re-adding an identical vector is a
    /// no-op.
    pub fn add(&self, identity_id: &str, embedding: Embedding) -> Result<(), GalleryError> {
        self.verify_version(&embedding)?;

        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let exists = guard
            .entries
            .iter()
            .any(|e| e.identity_id == identity_id && e.embedding.values == embedding.values);
        if exists {
            return Ok(());
        }

        let mut entries = guard.entries.clone();
        entries.push(Entry { identity_id: identity_id.to_string(), embedding });
        *guard = Arc::new(Snapshot { entries });
        Ok(())
    }

    /// Drop every embedding enrolled under an identity. Returns how many
    /// entries were removed.
    pub fn remove(&self, identity_id: &str) -> usize {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<Entry> =
            guard.entries.iter().filter(|e| e.identity_id != identity_id).cloned().collect();
        let removed = guard.entries.len() - entries.len();
        if removed > 0 {
            *guard = Arc::new(Snapshot { entries });
        }
        removed
    }

    /// The `k` closest enrolled embeddings, sorted by non-decreasing
    /// distance. Asking for more than the gallery holds returns everything.
    pub fn nearest_neighbors(
        &self,
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<Neighbor>, GalleryError> {
        self.verify_version(query)?;

        let snapshot = self.read();
        let mut hits: Vec<Neighbor> = snapshot
            .entries
            .iter()
            .map(|e| Neighbor {
                identity_id: e.identity_id.clone(),
                distance: e.embedding.distance(query),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// One-to-one check of a probe against a single identity's enrolled
    /// embeddings. The closest of the identity's embeddings must be within
    /// `accept_threshold`; no ambiguity margin applies since no other
    /// identity competes. An identity with nothing enrolled fails closed.
    pub fn verify(&self, query: &Embedding, identity_id: &str) -> Result<MatchResult, GalleryError> {
        self.verify_version(query)?;

        let snapshot = self.read();
        let best = snapshot
            .entries
            .iter()
            .filter(|e| e.identity_id == identity_id)
            .map(|e| e.embedding.distance(query))
            .fold(None, |acc: Option<f32>, d| Some(acc.map_or(d, |a| a.min(d))));

        let result = match best {
            Some(distance) => {
                let decision = if distance <= self.accept_threshold {
                    Decision::Accepted
                } else {
                    Decision::Rejected
                };
                MatchResult {
                    decision,
                    best: Some(MatchCandidate { identity_id: identity_id.to_string(), distance }),
                    runners_up: Vec::new(),
                }
            }
            None => MatchResult { decision: Decision::Rejected, best: None, runners_up: Vec::new() },
        };
        Ok(result)
    }

    /// Two-threshold identify decision.
    ///
    /// The best distinct identity is accepted when its distance is within
    /// `accept_threshold` and the second-best distinct identity trails by
    /// more than `ambiguity_margin`. A close runner-up turns the decision
    /// ambiguous; a best match beyond the threshold is a rejection (unknown
    /// person), as is an empty gallery.
    pub fn decide(&self, query: &Embedding) -> Result<MatchResult, GalleryError> {
        self.verify_version(query)?;

        let snapshot = self.read();

        // Best distance per distinct identity, full traversal.
        let mut best_per_identity: HashMap<&str, f32> = HashMap::new();
        for entry in &snapshot.entries {
            let d = entry.embedding.distance(query);
            best_per_identity
                .entry(entry.identity_id.as_str())
                .and_modify(|cur| *cur = cur.min(d))
                .or_insert(d);
        }

        let mut ranked: Vec<MatchCandidate> = best_per_identity
            .into_iter()
            .map(|(id, distance)| MatchCandidate { identity_id: id.to_string(), distance })
            .collect();
        ranked.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));

        let Some(best) = ranked.first().cloned() else {
            return Ok(MatchResult { decision: Decision::Rejected, best: None, runners_up: Vec::new() });
        };

        if best.distance > self.accept_threshold {
            return Ok(MatchResult {
                decision: Decision::Rejected,
                best: Some(best),
                runners_up: Vec::new(),
            });
        }

        let close_runners: Vec<MatchCandidate> = ranked[1..]
            .iter()
            .filter(|c| c.distance - best.distance <= self.ambiguity_margin)
            .cloned()
            .collect();

        if close_runners.is_empty() {
            Ok(MatchResult { decision: Decision::Accepted, best: Some(best), runners_up: Vec::new() })
        } else {
            Ok(MatchResult {
                decision: Decision::Ambiguous,
                best: Some(best),
                runners_up: close_runners,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EnrolledEmbedding;
    use std::sync::Mutex;

    fn config() -> PipelineConfig {
        PipelineConfig {
            encoder_version: "v1".into(),
            accept_threshold: 1.0,
            ambiguity_margin: 0.2,
            ..Default::default()
        }
    }

    fn embedding(values: Vec<f32>) -> Embedding {
        Embedding::new(values, "v1")
    }

    struct FixedStore {
        rows: Mutex<Vec<EnrolledEmbedding>>,
    }

    impl IdentityStore for FixedStore {
        fn load_all_embeddings(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
            Ok(self.rows.lock().unwrap().clone())
        }

        fn persist_enrollment(
            &self,
            _identity: &crate::types::Identity,
            _embeddings: &[Embedding],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn delete_identity(&self, _identity_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_nearest_neighbors_sorted() {
        let gallery = Gallery::new(&config());
        gallery.add("far", embedding(vec![10.0, 0.0])).unwrap();
        gallery.add("near", embedding(vec![1.0, 0.0])).unwrap();
        gallery.add("mid", embedding(vec![5.0, 0.0])).unwrap();

        let hits = gallery.nearest_neighbors(&embedding(vec![0.0, 0.0]), 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].identity_id, "near");
        assert_eq!(hits[1].identity_id, "mid");
        assert_eq!(hits[2].identity_id, "far");
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_nearest_neighbors_k_exceeds_len() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0])).unwrap();
        gallery.add("b", embedding(vec![2.0])).unwrap();

        let hits = gallery.nearest_neighbors(&embedding(vec![0.0]), 50).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_add_is_idempotent() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0, 2.0])).unwrap();
        gallery.add("a", embedding(vec![1.0, 2.0])).unwrap();
        assert_eq!(gallery.len(), 1);

        // Same identity, different vector: a second entry.
        gallery.add("a", embedding(vec![1.0, 3.0])).unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.identity_count(), 1);
    }

    #[test]
    fn test_remove_drops_all_for_identity() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0])).unwrap();
        gallery.add("a", embedding(vec![2.0])).unwrap();
        gallery.add("b", embedding(vec![3.0])).unwrap();

        assert_eq!(gallery.remove("a"), 2);
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.remove("a"), 0);
    }

    #[test]
    fn test_version_mismatch_rejected_on_add_and_query() {
        let gallery = Gallery::new(&config());
        let stale = Embedding::new(vec![1.0], "v0");
        assert!(matches!(
            gallery.add("a", stale.clone()),
            Err(GalleryError::EncoderVersionMismatch { .. })
        ));
        assert!(matches!(
            gallery.nearest_neighbors(&stale, 1),
            Err(GalleryError::EncoderVersionMismatch { .. })
        ));
        assert!(matches!(gallery.decide(&stale), Err(GalleryError::EncoderVersionMismatch { .. })));
    }

    #[test]
    fn test_warm_start_skips_mismatched_versions() {
        let gallery = Gallery::new(&config());
        let store = FixedStore {
            rows: Mutex::new(vec![
                EnrolledEmbedding { identity_id: "a".into(), embedding: embedding(vec![1.0]) },
                EnrolledEmbedding {
                    identity_id: "b".into(),
                    embedding: Embedding::new(vec![2.0], "v0"),
                },
            ]),
        };

        let loaded = gallery.warm_start(&store).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_warm_start_replaces_previous_contents() {
        let gallery = Gallery::new(&config());
        gallery.add("old", embedding(vec![9.0])).unwrap();

        let store = FixedStore {
            rows: Mutex::new(vec![EnrolledEmbedding {
                identity_id: "new".into(),
                embedding: embedding(vec![1.0]),
            }]),
        };
        gallery.warm_start(&store).unwrap();

        assert_eq!(gallery.len(), 1);
        let hits = gallery.nearest_neighbors(&embedding(vec![1.0]), 1).unwrap();
        assert_eq!(hits[0].identity_id, "new");
    }

    #[test]
    fn test_decide_empty_gallery_rejects() {
        let gallery = Gallery::new(&config());
        let result = gallery.decide(&embedding(vec![0.0])).unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        assert!(result.best.is_none());
    }

    #[test]
    fn test_decide_accepts_at_exact_threshold() {
        // accept_threshold 1.0: a match at exactly that distance is accepted
        // when no runner-up sits within the margin.
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0, 0.0])).unwrap();
        gallery.add("b", embedding(vec![5.0, 0.0])).unwrap();

        let result = gallery.decide(&embedding(vec![0.0, 0.0])).unwrap();
        assert_eq!(result.decision, Decision::Accepted);
        assert_eq!(result.best.as_ref().unwrap().identity_id, "a");
        assert!((result.best.as_ref().unwrap().distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decide_flips_to_ambiguous_when_runner_up_closes_in() {
        // Same probe as above, but "b" moved to within the 0.2 margin.
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0, 0.0])).unwrap();
        gallery.add("b", embedding(vec![1.1, 0.0])).unwrap();

        let result = gallery.decide(&embedding(vec![0.0, 0.0])).unwrap();
        assert_eq!(result.decision, Decision::Ambiguous);
        assert_eq!(result.best.as_ref().unwrap().identity_id, "a");
        assert_eq!(result.runners_up.len(), 1);
        assert_eq!(result.runners_up[0].identity_id, "b");
    }

    #[test]
    fn test_decide_rejects_beyond_threshold() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![10.0, 0.0])).unwrap();

        let result = gallery.decide(&embedding(vec![0.0, 0.0])).unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        // The too-far best is still reported for diagnostics.
        assert_eq!(result.best.as_ref().unwrap().identity_id, "a");
    }

    #[test]
    fn test_decide_same_identity_duplicates_do_not_make_ambiguity() {
        // Two close embeddings of the SAME identity must not trigger the
        // ambiguity margin; only distinct identities compete.
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![1.0, 0.0])).unwrap();
        gallery.add("a", embedding(vec![1.05, 0.0])).unwrap();

        let result = gallery.decide(&embedding(vec![0.0, 0.0])).unwrap();
        assert_eq!(result.decision, Decision::Accepted);
    }

    #[test]
    fn test_verify_accepts_within_threshold() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![0.5, 0.0])).unwrap();
        gallery.add("a", embedding(vec![3.0, 0.0])).unwrap();

        let result = gallery.verify(&embedding(vec![0.0, 0.0]), "a").unwrap();
        assert_eq!(result.decision, Decision::Accepted);
        // The closest of the identity's embeddings wins.
        assert!((result.best.unwrap().distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_verify_ignores_other_identities() {
        // A very close embedding of someone else must not help the claim.
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![5.0, 0.0])).unwrap();
        gallery.add("b", embedding(vec![0.1, 0.0])).unwrap();

        let result = gallery.verify(&embedding(vec![0.0, 0.0]), "a").unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        assert_eq!(result.best.unwrap().identity_id, "a");
    }

    #[test]
    fn test_verify_unknown_identity_fails_closed() {
        let gallery = Gallery::new(&config());
        gallery.add("a", embedding(vec![0.0, 0.0])).unwrap();

        let result = gallery.verify(&embedding(vec![0.0, 0.0]), "ghost").unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        assert!(result.best.is_none());
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        let gallery = Arc::new(Gallery::new(&config()));

        let writer = {
            let gallery = Arc::clone(&gallery);
            std::thread::spawn(move || {
                for i in 0..200 {
                    gallery.add("w", embedding(vec![i as f32])).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let gallery = Arc::clone(&gallery);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..200 {
                        let hits = gallery.nearest_neighbors(&embedding(vec![0.0]), usize::MAX).unwrap();
                        // Snapshots only ever grow in this scenario.
                        assert!(hits.len() >= last);
                        last = hits.len();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(gallery.len(), 200);
    }
}
