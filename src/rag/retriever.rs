//! Context Retriever
//!
//! Embeds the question and pulls the closest record summaries from the
//! similarity index. Retrieval only improves the prompt, so every failure
//! here degrades to "no context".

use crate::rag::embedder::EmbeddingProvider;
use crate::rag::vector_store::SimilarityIndex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Summaries fetched per requested result, to leave room for deduplication
const OVERFETCH_FACTOR: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedContext {
    pub summary: String,
    pub distance: f32,
}

pub struct ContextRetriever {
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
}

impl ContextRetriever {
    pub fn new(
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            timeout,
        }
    }

    /// Up to `k` distinct summaries, nearest first
    pub async fn retrieve(&self, question: &str, k: usize) -> Vec<RetrievedContext> {
        if k == 0 || self.index.is_empty() {
            return Vec::new();
        }

        let vector = match tokio::time::timeout(self.timeout, self.embedder.embed(question)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(error = %e, "Question embedding failed, continuing without context");
                return Vec::new();
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Question embedding timed out, continuing without context");
                return Vec::new();
            }
        };

        let hits = match self.index.search(&vector, k.saturating_mul(OVERFETCH_FACTOR)) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Similarity search failed, continuing without context");
                return Vec::new();
            }
        };

        // Hits arrive nearest first, so the first copy of a summary is the closer one
        let mut seen = HashSet::new();
        let context: Vec<RetrievedContext> = hits
            .into_iter()
            .filter(|hit| seen.insert(hit.record.summary.clone()))
            .take(k)
            .map(|hit| RetrievedContext {
                summary: hit.record.summary,
                distance: hit.distance,
            })
            .collect();

        debug!(retrieved = context.len(), "Retrieved context summaries");
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::rag::embedder::HashingEmbedder;
    use crate::rag::vector_store::{Embedding, RecordSummary};
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Embedding>> {
            Err(EngineError::EmbeddingUnavailable("model not loaded".to_string()))
        }

        fn dimension(&self) -> usize {
            16
        }
    }

    fn seeded_index(embedder: &HashingEmbedder, summaries: &[&str]) -> Arc<SimilarityIndex> {
        let index = SimilarityIndex::new(embedder.dimension());
        for (i, summary) in summaries.iter().enumerate() {
            index
                .insert(
                    RecordSummary {
                        id: format!("s{}", i),
                        summary: summary.to_string(),
                        anchor: None,
                    },
                    embedder.embed_text(summary),
                )
                .unwrap();
        }
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_retrieve_deduplicates_summaries() {
        let embedder = HashingEmbedder::new(256);
        let index = seeded_index(
            &embedder,
            &[
                "Float 2902746 temperature profile in the Bay of Bengal",
                "Float 2902746 temperature profile in the Bay of Bengal",
                "Float 1901766 salinity profile in the Arabian Sea",
            ],
        );
        let retriever = ContextRetriever::new(index.clone(), Arc::new(embedder), Duration::from_secs(1));

        let context = retriever.retrieve("temperature in the Bay of Bengal", 3).await;
        assert_eq!(context.len(), 2);
        assert!(context[0].summary.contains("Bay of Bengal"));
        assert!(context[0].distance <= context[1].distance);
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_embedding_failure_returns_empty() {
        let index = SimilarityIndex::new(16);
        index
            .insert(
                RecordSummary {
                    id: "a".to_string(),
                    summary: "x".to_string(),
                    anchor: None,
                },
                vec![1.0; 16],
            )
            .unwrap();
        let retriever = ContextRetriever::new(Arc::new(index), Arc::new(FailingEmbedder), Duration::from_secs(1));
        assert!(retriever.retrieve("anything", 3).await.is_empty());
    }
}
