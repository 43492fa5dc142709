//! Query Translator
//!
//! Two phases. The generative phase builds a prompt and asks the completion
//! provider for SQL; its output is never trusted. The deterministic phase
//! cleans, parses, validates and rewrites that text into one read-only
//! query. Only the deterministic phase decides what reaches the database.
//!
//! ```text
//! Received -> Prompted -> Parsed -> Rejected            (UnsafeQuery)
//!                                -> Rewritten -> Validated
//! generative failure                              (TranslationUnavailable)
//! ```
//!
//! There is no retry here; the engine owns the retry policy.

pub mod prompt;
pub mod rewrite;
pub mod validator;

use crate::error::{EngineError, Result};
use crate::llm::CompletionProvider;
use crate::rag::RetrievedContext;
use crate::schema::SchemaDescriptor;
use prompt::{build_prompt, QuestionAnalysis};
use rewrite::{apply_rewrites, RewriteRule};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use validator::{
    assess_complexity, check_read_only, clean_raw_output, parse_single_statement, projected_columns,
};

pub use prompt::{QueryType, Region};
pub use validator::{ProjectedColumn, QueryComplexity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TranslationStage {
    Received,
    Prompted,
    Parsed,
    Rejected,
    Rewritten,
    Validated,
}

/// A validated, rewritten, read-only query ready for execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedQuery {
    pub sql: String,
    /// LIMIT carried by `sql` after row-cap enforcement
    pub row_limit: u64,
    pub rewrites: Vec<RewriteRule>,
    pub complexity: QueryComplexity,
}

impl TranslatedQuery {
    pub fn rewritten(&self) -> bool {
        !self.rewrites.is_empty()
    }

    /// True when the LIMIT came from the row cap rather than the question
    pub fn row_cap_applied(&self) -> bool {
        self.rewrites
            .iter()
            .any(|r| matches!(r, RewriteRule::RowCapInjected | RewriteRule::RowCapClamped))
    }

    /// Output columns of the query and the schema columns behind them
    pub fn projection(&self) -> Vec<ProjectedColumn> {
        parse_single_statement(&self.sql)
            .map(|statement| projected_columns(&statement))
            .unwrap_or_default()
    }
}

pub struct QueryTranslator {
    schema: Arc<SchemaDescriptor>,
    completion: Arc<dyn CompletionProvider>,
    row_cap: u64,
}

impl QueryTranslator {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        completion: Arc<dyn CompletionProvider>,
        row_cap: u64,
    ) -> Self {
        Self {
            schema,
            completion,
            row_cap,
        }
    }

    /// Full translation: prompt, complete, validate and rewrite
    pub async fn translate(
        &self,
        question: &str,
        context: &[RetrievedContext],
    ) -> Result<TranslatedQuery> {
        debug!(stage = ?TranslationStage::Received, context = context.len(), "Translating question");

        let analysis = QuestionAnalysis::from_question(question, &self.schema);
        let prompt = build_prompt(question, &self.schema, context, &analysis, self.row_cap);
        debug!(stage = ?TranslationStage::Prompted, query_type = ?analysis.query_type, "Prompt built");

        let raw = self.completion.complete(&prompt).await.map_err(|failure| {
            warn!(reason = %failure, "Completion provider failed");
            EngineError::TranslationUnavailable(failure.reason)
        })?;

        self.validate(&raw)
    }

    /// Deterministic phase on raw generated text. Running it again on the
    /// resulting `sql` yields the same query.
    pub fn validate(&self, raw: &str) -> Result<TranslatedQuery> {
        let outcome = self.validate_inner(raw);
        if let Err(e) = &outcome {
            warn!(stage = ?TranslationStage::Rejected, error = %e, "Generated query rejected");
        }
        outcome
    }

    fn validate_inner(&self, raw: &str) -> Result<TranslatedQuery> {
        let cleaned = clean_raw_output(raw)?;
        let mut statement = parse_single_statement(&cleaned)?;
        debug!(stage = ?TranslationStage::Parsed, sql = %cleaned, "Parsed generated query");

        check_read_only(&statement, &self.schema)?;

        let outcome = apply_rewrites(&mut statement, &self.schema, self.row_cap)?;
        debug!(stage = ?TranslationStage::Rewritten, rules = ?outcome.fired, "Applied rewrite rules");

        // The rewritten text must still pass the same checks
        let sql = statement.to_string();
        let reparsed = parse_single_statement(&sql)?;
        check_read_only(&reparsed, &self.schema)?;

        let translated = TranslatedQuery {
            complexity: assess_complexity(&reparsed),
            sql,
            row_limit: outcome.row_limit,
            rewrites: outcome.fired,
        };
        debug!(
            stage = ?TranslationStage::Validated,
            sql = %translated.sql,
            complexity = translated.complexity.score,
            "Query validated"
        );
        Ok(translated)
    }
}
