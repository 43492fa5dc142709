use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ocean_query::execution::{QueryBackend, RawTable};
use ocean_query::rag::{build_embedder, RecordSummary, SimilarityIndex};
use ocean_query::{EngineConfig, EngineError, QueryEngine};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EMBED_BATCH_SIZE: usize = 64;

#[derive(Parser)]
#[command(name = "ocean-query")]
#[command(about = "Answer natural-language questions over ARGO float profiles")]
struct Args {
    /// JSON configuration file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a question end to end
    Ask {
        question: String,

        /// Print the full resolution as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the validated SQL for a question without running it
    Translate { question: String },
    /// Embed record summaries from a JSONL file and add them to the index
    Index { summaries: PathBuf },
}

/// `translate` never executes; any attempt is an error
struct NoDatabase;

#[async_trait]
impl QueryBackend for NoDatabase {
    async fn fetch(&self, sql: &str, _row_cap: u64) -> ocean_query::Result<RawTable> {
        Err(EngineError::QueryExecution {
            query: sql.to_string(),
            message: "translate mode does not execute queries".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    match args.command {
        Command::Ask { question, json } => ask(&config, &question, json).await,
        Command::Translate { question } => translate(&config, &question).await,
        Command::Index { summaries } => index(&config, &summaries).await,
    }
}

async fn ask(config: &EngineConfig, question: &str, json: bool) -> Result<()> {
    let engine = QueryEngine::from_config(config).await?;
    match engine.resolve(question).await {
        Ok(resolution) if json => {
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Ok(resolution) => {
            println!("{}", resolution.answer_text);
            println!("\nSQL: {}", resolution.translated_query.sql);
            for warning in &resolution.warnings {
                println!(
                    "warning: {} cell(s) in '{}' set to null ({})",
                    warning.affected_cells, warning.column, warning.reason
                );
            }
            if !resolution.follow_ups.is_empty() {
                println!("\nYou could also ask:");
                for follow_up in &resolution.follow_ups {
                    println!("  - {}", follow_up);
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Question could not be resolved");
            println!("{}", e.user_message());
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn translate(config: &EngineConfig, question: &str) -> Result<()> {
    let engine = QueryEngine::with_backend(config, Arc::new(NoDatabase))?;
    let translated = engine.translate_only(question).await?;
    println!("{}", translated.sql);
    info!(
        row_limit = translated.row_limit,
        rewrites = ?translated.rewrites,
        complexity = %translated.complexity.description,
        "Translated"
    );
    Ok(())
}

async fn index(config: &EngineConfig, summaries: &Path) -> Result<()> {
    let file = std::fs::File::open(summaries)
        .with_context(|| format!("Failed to open {}", summaries.display()))?;

    let mut records = Vec::new();
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RecordSummary = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {}", line_no + 1))?;
        records.push(record);
    }

    let embedder = build_embedder(&config.embedding, &config.llm)?;
    let path = &config.retrieval.index_path;
    let index = SimilarityIndex::open_or_create(path, embedder.dimension())?;
    let before = index.len();

    for chunk in records.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = chunk.iter().map(|r| r.summary.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        index.insert_batch(chunk.iter().cloned().zip(vectors).collect())?;
    }
    index.persist(path)?;

    info!(
        added = index.len() - before,
        total = index.len(),
        path = %path.display(),
        "Index updated"
    );
    Ok(())
}
