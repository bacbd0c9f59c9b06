use crate::error::{RagError, Result};
use crate::index::IndexHandle;
use crate::models::{RetrievalResult, RetrievedChunk};
use crate::resilience::CallPolicy;
use crate::traits::Embedder;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<IndexHandle>,
    policy: CallPolicy,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<IndexHandle>) -> Self {
        Self {
            embedder,
            index,
            policy: CallPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    pub async fn retrieve(&self, query: &str, threshold: f32, k: usize) -> Result<RetrievalResult> {
        self.retrieve_until(query, threshold, k, None).await
    }

    /// Hits scoring strictly below `threshold` are dropped; an empty result
    /// means nothing relevant was found and is not an error. The embed call
    /// is abandoned at `deadline`.
    pub async fn retrieve_until(
        &self,
        query: &str,
        threshold: f32,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidRequest("query is empty".to_string()));
        }
        if threshold.is_nan() {
            return Err(RagError::InvalidRequest(
                "similarity threshold must be a number".to_string(),
            ));
        }
        if k == 0 {
            return Ok(RetrievalResult::default());
        }

        let embedder = self.embedder.as_ref();
        let query_vector = self
            .policy
            .run_until("embed", deadline, move || embedder.embed(query))
            .await?;

        // Snapshot taken after the embed call so no index state is pinned
        // while the collaborator is in flight.
        let snapshot = self.index.snapshot();
        let candidates = snapshot.search(&query_vector, k)?;
        let candidate_count = candidates.len();

        let hits: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .take(k)
            .map(|hit| RetrievedChunk {
                chunk_id: hit.record.chunk.chunk_id.clone(),
                document_id: hit.record.chunk.document_id.clone(),
                chunk_index: hit.record.chunk.chunk_index,
                source_path: snapshot
                    .document(&hit.record.chunk.document_id)
                    .and_then(|metadata| metadata.source_path.clone()),
                text: hit.record.chunk.text.clone(),
                score: hit.score,
            })
            .collect();

        debug!(candidate_count, threshold, k, "ranked candidates");
        info!(result_count = hits.len(), "retrieval completed");
        Ok(RetrievalResult { hits })
    }
}
