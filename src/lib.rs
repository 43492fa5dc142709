pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod execution;
pub mod llm;
pub mod normalizer;
pub mod rag;
pub mod response;
pub mod schema;
pub mod translator;

// Database module for PostgreSQL
pub mod db;

pub use config::EngineConfig;
pub use engine::{QueryEngine, Resolution};
pub use error::{EngineError, Result};
pub use schema::SchemaDescriptor;
pub use translator::TranslatedQuery;
