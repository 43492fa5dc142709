//! Query Resolution Engine
//!
//! `resolve` runs one question end to end:
//! retrieve -> translate -> execute -> normalize -> synthesize.
//! Each call is independent; the engine holds only read-only shared state.

use crate::config::EngineConfig;
use crate::db::connect_read_only;
use crate::error::{EngineError, Result};
use crate::execution::{PgBackend, QueryBackend, QueryExecutor};
use crate::llm::{CompletionProvider, LlmClient};
use crate::normalizer::{NormalizationWarning, NormalizedTable};
use crate::rag::{build_embedder, ContextRetriever, EmbeddingProvider, RetrievedContext, SimilarityIndex};
use crate::response::ResponseSynthesizer;
use crate::schema::SchemaDescriptor;
use crate::translator::{QueryTranslator, TranslatedQuery};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Everything `resolve` hands to the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub request_id: Uuid,
    pub answer_text: String,
    pub follow_ups: Vec<String>,
    pub table: NormalizedTable,
    pub translated_query: TranslatedQuery,
    pub warnings: Vec<NormalizationWarning>,
    pub context: Vec<RetrievedContext>,
}

pub struct QueryEngine {
    retriever: ContextRetriever,
    translator: QueryTranslator,
    executor: QueryExecutor,
    synthesizer: ResponseSynthesizer,
    top_k: usize,
    row_cap: u64,
}

impl QueryEngine {
    /// Assemble an engine from already-built capabilities
    pub fn new(
        config: &EngineConfig,
        schema: Arc<SchemaDescriptor>,
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        backend: Arc<dyn QueryBackend>,
    ) -> Self {
        let row_cap = config.database.effective_row_cap();
        Self {
            retriever: ContextRetriever::new(index, embedder, config.embedding.timeout()),
            translator: QueryTranslator::new(schema.clone(), completion, row_cap),
            executor: QueryExecutor::new(backend, config.database.statement_timeout()),
            synthesizer: ResponseSynthesizer::new(schema),
            top_k: config.retrieval.top_k,
            row_cap,
        }
    }

    /// Build every capability from configuration: schema, embedder, index,
    /// completion client and read-only database pool.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let pool = connect_read_only(&config.database).await?;
        let backend = PgBackend::new(pool, config.database.statement_timeout_ms);
        Self::with_backend(config, Arc::new(backend))
    }

    /// Same as `from_config` but with a caller-supplied relational store
    pub fn with_backend(config: &EngineConfig, backend: Arc<dyn QueryBackend>) -> Result<Self> {
        config.validate()?;
        let schema = match &config.schema_path {
            Some(path) => SchemaDescriptor::load(path)?,
            None => SchemaDescriptor::argo_profiles(),
        };
        let embedder = build_embedder(&config.embedding, &config.llm)?;
        let index = SimilarityIndex::open_or_create(&config.retrieval.index_path, embedder.dimension())?;
        info!(
            table = %schema.table,
            indexed = index.len(),
            path = %config.retrieval.index_path.display(),
            "Similarity index ready"
        );

        let completion = LlmClient::new(&config.llm)
            .map_err(|failure| EngineError::Config(failure.reason))?;

        Ok(Self::new(
            config,
            Arc::new(schema),
            Arc::new(index),
            embedder,
            Arc::new(completion),
            backend,
        ))
    }

    /// Answer one question
    pub async fn resolve(&self, question: &str) -> Result<Resolution> {
        let request_id = Uuid::new_v4();
        let span = info_span!("resolve", request_id = %request_id);
        self.resolve_inner(request_id, question).instrument(span).await
    }

    /// Retrieve and translate without touching the database
    pub async fn translate_only(&self, question: &str) -> Result<TranslatedQuery> {
        let question = non_empty(question)?;
        let context = self.retriever.retrieve(question, self.top_k).await;
        self.translate_with_retry(question, &context).await
    }

    async fn resolve_inner(&self, request_id: Uuid, question: &str) -> Result<Resolution> {
        let question = non_empty(question)?;
        let start = Instant::now();
        info!(question = %question, "Resolving question");

        let context = self.retriever.retrieve(question, self.top_k).await;
        let translated = self.translate_with_retry(question, &context).await?;
        self.recheck(&translated)?;

        let normalized = self.executor.execute(&translated, self.row_cap).await?;
        let response = self
            .synthesizer
            .synthesize(question, &normalized.table, &translated);

        info!(
            rows = normalized.table.row_count(),
            warnings = normalized.warnings.len(),
            rewrites = translated.rewrites.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Question resolved"
        );

        Ok(Resolution {
            request_id,
            answer_text: response.answer_text,
            follow_ups: response.follow_ups,
            table: normalized.table,
            translated_query: translated,
            warnings: normalized.warnings,
            context,
        })
    }

    /// At most one retry, and only for a failed generative call
    async fn translate_with_retry(
        &self,
        question: &str,
        context: &[RetrievedContext],
    ) -> Result<TranslatedQuery> {
        match self.translator.translate(question, context).await {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Translation failed, retrying once");
                self.translator.translate(question, context).await
            }
            outcome => outcome,
        }
    }

    /// Validate the final text again before it reaches the database
    fn recheck(&self, translated: &TranslatedQuery) -> Result<()> {
        let again = self.translator.validate(&translated.sql)?;
        if again.sql != translated.sql {
            return Err(EngineError::UnsafeQuery(
                "Rewritten query did not validate to itself".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(EngineError::UnsafeQuery("Empty question".to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{RawTable, RawValue};
    use crate::llm::CompletionFailure;
    use crate::rag::HashingEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then answers with `sql`
    struct Flaky {
        failures: usize,
        sql: String,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize, sql: &str) -> Self {
            Self {
                failures,
                sql: sql.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for Flaky {
        async fn complete(&self, _prompt: &str) -> std::result::Result<String, CompletionFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(CompletionFailure::new("503 Service Unavailable"))
            } else {
                Ok(self.sql.clone())
            }
        }
    }

    struct OneRow;

    #[async_trait]
    impl QueryBackend for OneRow {
        async fn fetch(&self, _sql: &str, _row_cap: u64) -> Result<RawTable> {
            Ok(RawTable {
                columns: vec!["pressure".to_string()],
                rows: vec![vec![RawValue::Float(12.5)]],
            })
        }
    }

    fn engine(completion: Arc<Flaky>) -> QueryEngine {
        let config = EngineConfig::default();
        QueryEngine::new(
            &config,
            Arc::new(SchemaDescriptor::argo_profiles()),
            Arc::new(SimilarityIndex::new(64)),
            Arc::new(HashingEmbedder::new(64)),
            completion,
            Arc::new(OneRow),
        )
    }

    #[tokio::test]
    async fn test_translation_retried_once() {
        let completion = Arc::new(Flaky::new(1, "SELECT pressure FROM argo_profiles"));
        let resolution = engine(completion.clone()).resolve("pressure readings").await.unwrap();
        assert_eq!(completion.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolution.table.row_count(), 1);
        assert!(resolution.translated_query.sql.ends_with("LIMIT 1000"));
    }

    #[tokio::test]
    async fn test_translation_not_retried_twice() {
        let completion = Arc::new(Flaky::new(2, "SELECT pressure FROM argo_profiles"));
        let err = engine(completion.clone()).resolve("pressure readings").await.unwrap_err();
        assert!(matches!(err, EngineError::TranslationUnavailable(_)));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsafe_query_not_retried() {
        let completion = Arc::new(Flaky::new(0, "DROP TABLE argo_profiles"));
        let err = engine(completion.clone()).resolve("delete everything").await.unwrap_err();
        assert!(matches!(err, EngineError::UnsafeQuery(_)));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let completion = Arc::new(Flaky::new(0, "SELECT 1"));
        let err = engine(completion.clone()).resolve("   ").await.unwrap_err();
        assert!(matches!(err, EngineError::UnsafeQuery(_)));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_translate_only_skips_execution() {
        let completion = Arc::new(Flaky::new(0, "SELECT float_id FROM argo_profiles LIMIT 5"));
        let translated = engine(completion).translate_only("list floats").await.unwrap();
        assert_eq!(translated.sql, "SELECT float_id FROM argo_profiles LIMIT 5");
        assert_eq!(translated.row_limit, 5);
    }
}
