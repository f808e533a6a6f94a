//! PARLEY Retrieval - Per-Persona Knowledge Bases
//!
//! Maps each persona to a named vector collection of embedded text
//! chunks and answers similarity queries against it. The engine is
//! shared across sessions; every request binds `(collection, embedder)`
//! freshly so tenant parameters never leak between calls.

mod chunker;
mod engine;
mod store;

pub use chunker::{chunk_text, CHUNK_OVERLAP_CHARS, TARGET_CHUNK_CHARS};
pub use engine::{IngestReport, RetrievalEngine};
pub use store::{ChunkRecord, InMemoryVectorStore, QdrantVectorStore, ScoredChunk, VectorStore};
