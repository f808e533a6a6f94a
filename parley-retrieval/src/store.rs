//! Vector store backends
//!
//! The engine talks to storage through the [`VectorStore`] trait. The
//! production backend is Qdrant; tests use the in-memory cosine store.

use async_trait::async_trait;
use parley_core::RetrievalError;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// One embedded chunk ready for upsert.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Stable 16-hex-char id (see `parley_core::chunk_id`).
    pub id: String,
    pub text: String,
    pub source: String,
    pub vector: Vec<f32>,
}

/// A search hit, highest score first.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub source: String,
    pub score: f32,
}

/// Storage contract for per-persona collections.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, RetrievalError>;

    /// Create the collection with the given vector dimension if absent.
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<(), RetrievalError>;

    async fn upsert(&self, name: &str, chunks: Vec<ChunkRecord>) -> Result<(), RetrievalError>;

    /// Remove every chunk carrying the given source tag.
    async fn delete_by_source(&self, name: &str, source: &str) -> Result<(), RetrievalError>;

    async fn drop_collection(&self, name: &str) -> Result<(), RetrievalError>;

    /// Top-k by cosine similarity, descending score. Callers are
    /// expected to have checked existence; missing collections error.
    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError>;
}

// ============================================================================
// QDRANT BACKEND
// ============================================================================

/// Qdrant-backed vector store. One shared client; collection names carry
/// the tenant isolation.
pub struct QdrantVectorStore {
    client: qdrant_client::Qdrant,
}

impl QdrantVectorStore {
    /// Connect to the Qdrant endpoint at `url`.
    pub fn connect(url: &str) -> Result<Self, RetrievalError> {
        let client = qdrant_client::Qdrant::from_url(url)
            .build()
            .map_err(|e| RetrievalError::VectorStore {
                reason: format!("connect {}: {}", url, e),
            })?;
        info!(url, "qdrant vector store initialized");
        Ok(Self { client })
    }

    /// Chunk ids are 16 hex chars, which is exactly a u64 point id.
    fn point_id(chunk_id: &str) -> u64 {
        u64::from_str_radix(chunk_id, 16).unwrap_or_else(|_| {
            // Fall back to a hash of the raw id for malformed input.
            chunk_id.bytes().fold(0u64, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as u64)
            })
        })
    }

    fn store_err(context: &str, e: impl std::fmt::Display) -> RetrievalError {
        RetrievalError::VectorStore {
            reason: format!("{}: {}", context, e),
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, RetrievalError> {
        self.client
            .collection_exists(name)
            .await
            .map_err(|e| Self::store_err("collection_exists", e))
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<(), RetrievalError> {
        use qdrant_client::qdrant::{CreateCollectionBuilder, Distance, VectorParamsBuilder};

        if self.collection_exists(name).await? {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| Self::store_err("create_collection", e))?;

        info!(collection = name, dimension, "created retrieval collection");
        Ok(())
    }

    async fn upsert(&self, name: &str, chunks: Vec<ChunkRecord>) -> Result<(), RetrievalError> {
        use qdrant_client::qdrant::{PointStruct, UpsertPointsBuilder};
        use qdrant_client::Payload;

        let points: Vec<PointStruct> = chunks
            .into_iter()
            .map(|chunk| {
                let mut payload = Payload::new();
                payload.insert("text", chunk.text);
                payload.insert("source", chunk.source);
                PointStruct::new(Self::point_id(&chunk.id), chunk.vector, payload)
            })
            .collect();

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points).wait(true))
            .await
            .map_err(|e| Self::store_err("upsert_points", e))?;

        debug!(collection = name, count, "upserted chunks");
        Ok(())
    }

    async fn delete_by_source(&self, name: &str, source: &str) -> Result<(), RetrievalError> {
        use qdrant_client::qdrant::{Condition, DeletePointsBuilder, Filter};

        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(Filter::must([Condition::matches(
                        "source",
                        source.to_string(),
                    )]))
                    .wait(true),
            )
            .await
            .map_err(|e| Self::store_err("delete_points", e))?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), RetrievalError> {
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| Self::store_err("delete_collection", e))?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        use qdrant_client::qdrant::value::Kind;
        use qdrant_client::qdrant::SearchPointsBuilder;

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(name, vector, top_k as u64).with_payload(true),
            )
            .await
            .map_err(|e| Self::store_err("search_points", e))?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let get_str = |key: &str| -> String {
                point
                    .payload
                    .get(key)
                    .and_then(|v| match &v.kind {
                        Some(Kind::StringValue(s)) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default()
            };
            hits.push(ScoredChunk {
                text: get_str("text"),
                source: get_str("source"),
                score: point.score,
            });
        }
        Ok(hits)
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
struct MemCollection {
    dimension: usize,
    points: HashMap<String, ChunkRecord>,
}

/// In-memory cosine store for tests and single-node development.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, MemCollection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, RetrievalError> {
        Ok(self
            .collections
            .lock()
            .expect("store poisoned")
            .contains_key(name))
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<(), RetrievalError> {
        self.collections
            .lock()
            .expect("store poisoned")
            .entry(name.to_string())
            .or_insert_with(|| MemCollection {
                dimension,
                points: HashMap::new(),
            });
        Ok(())
    }

    async fn upsert(&self, name: &str, chunks: Vec<ChunkRecord>) -> Result<(), RetrievalError> {
        let mut collections = self.collections.lock().expect("store poisoned");
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| RetrievalError::VectorStore {
                reason: format!("collection {} does not exist", name),
            })?;
        for chunk in chunks {
            if chunk.vector.len() != collection.dimension {
                return Err(RetrievalError::DimensionMismatch {
                    expected: collection.dimension,
                    got: chunk.vector.len(),
                });
            }
            collection.points.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn delete_by_source(&self, name: &str, source: &str) -> Result<(), RetrievalError> {
        let mut collections = self.collections.lock().expect("store poisoned");
        if let Some(collection) = collections.get_mut(name) {
            collection.points.retain(|_, chunk| chunk.source != source);
        }
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), RetrievalError> {
        self.collections
            .lock()
            .expect("store poisoned")
            .remove(name);
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let collections = self.collections.lock().expect("store poisoned");
        let collection = collections
            .get(name)
            .ok_or_else(|| RetrievalError::VectorStore {
                reason: format!("collection {} does not exist", name),
            })?;

        let mut scored: Vec<ScoredChunk> = collection
            .points
            .values()
            .map(|chunk| ScoredChunk {
                text: chunk.text.clone(),
                source: chunk.source.clone(),
                score: Self::cosine(&vector, &chunk.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, source: &str, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            text: format!("text-{}", id),
            source: source.to_string(),
            vector,
        }
    }

    #[tokio::test]
    async fn test_in_memory_search_ranks_by_cosine() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    record("a", "s", vec![1.0, 0.0]),
                    record("b", "s", vec![0.0, 1.0]),
                    record("m", "s", vec![0.7, 0.7]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("c", vec![1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "text-a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_in_memory_delete_by_source() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    record("a", "background", vec![1.0, 0.0]),
                    record("b", "https://example.com", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        store.delete_by_source("c", "background").await.unwrap();
        let hits = store.search("c", vec![1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "https://example.com");
    }

    #[tokio::test]
    async fn test_in_memory_dimension_check() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 3).await.unwrap();
        let err = store
            .upsert("c", vec![record("a", "s", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_drop_collection_removes_it() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        assert!(store.collection_exists("c").await.unwrap());
        store.drop_collection("c").await.unwrap();
        assert!(!store.collection_exists("c").await.unwrap());
    }

    #[test]
    fn test_point_id_from_hex() {
        assert_eq!(QdrantVectorStore::point_id("00000000000000ff"), 255);
        // Malformed ids still map deterministically.
        assert_eq!(
            QdrantVectorStore::point_id("not-hex!"),
            QdrantVectorStore::point_id("not-hex!")
        );
    }
}
