//! Knowledge match engine: nearest-neighbor lookup over curated Q&A pairs.
//!
//! Embeddings are produced on demand for both the query and each candidate
//! question; nothing is cached across calls. Embedding failure (empty
//! vector) degrades to "no match" so the pipeline falls through to intent
//! classification instead of erroring.

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::inference::Inference;
use crate::store::{EvidenceStore, KnowledgeEntry};

/// Minimum similarity for a candidate to be considered a match at all.
pub const MATCH_THRESHOLD: f64 = 0.7;
/// Similarity at which the router answers directly from the knowledge base,
/// skipping classification and inference entirely.
pub const AUTO_ANSWER_THRESHOLD: f64 = 0.8;

/// A knowledge entry together with its similarity to the query.
#[derive(Debug, Clone)]
pub struct KnowledgeMatch {
    pub entry: KnowledgeEntry,
    pub similarity: f64,
}

/// Cosine similarity between two embeddings. Empty vectors or a dimension
/// mismatch yield 0.0, never an error: embeddings are only comparable when
/// produced by the same model.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Answers queries by similarity over the curated knowledge base.
pub struct KnowledgeEngine {
    store: Arc<EvidenceStore>,
    inference: Arc<dyn Inference>,
}

impl KnowledgeEngine {
    pub fn new(store: Arc<EvidenceStore>, inference: Arc<dyn Inference>) -> Self {
        Self { store, inference }
    }

    /// Best matching active entry for the query, filtered to entries with no
    /// team label or the given team. Returns `None` when no candidate clears
    /// [`MATCH_THRESHOLD`] or when embeddings are degraded.
    pub async fn best_match(&self, query: &str, team: Option<&str>) -> Result<Option<KnowledgeMatch>> {
        let query_embedding = self.inference.embed(query).await;
        if query_embedding.is_empty() {
            debug!("Query embedding unavailable, knowledge lookup degrades to no match");
            return Ok(None);
        }

        let candidates = self.store.active_knowledge_entries(team)?;
        let mut best: Option<KnowledgeMatch> = None;

        for entry in candidates {
            let entry_embedding = self.inference.embed(&entry.question).await;
            let similarity = cosine_similarity(&query_embedding, &entry_embedding);
            if similarity < MATCH_THRESHOLD {
                continue;
            }
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(KnowledgeMatch { entry, similarity });
            }
        }

        if let Some(ref m) = best {
            debug!(
                "Knowledge match: {} (similarity {:.3})",
                m.entry.kb_id, m.similarity
            );
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_similarity_is_one() {
        let v = vec![0.3f32, -0.5, 0.8, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = vec![1.0f32, 2.0, 3.0];
        let b = vec![-1.0f32, 0.5, 2.0];
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn empty_or_mismatched_vectors_yield_zero() {
        let a = vec![1.0f32, 2.0];
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        assert_eq!(cosine_similarity(&[], &a), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn orthogonal_vectors_yield_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
    }
}
