//! Retrieval-augmented context: embeddings, the similarity index and the
//! retriever that combines them.

pub mod embedder;
pub mod retriever;
pub mod vector_store;

pub use embedder::{build_embedder, EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use retriever::{ContextRetriever, RetrievedContext};
pub use vector_store::{Embedding, RecordSummary, SearchHit, SimilarityIndex};
