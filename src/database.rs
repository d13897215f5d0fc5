use crate::chunking::TextChunk;
use crate::embeddings::Embedding;
use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};
use qdrant_client::qdrant::{
    with_payload_selector, CreateCollectionBuilder, Distance, PointStruct, SearchPoints,
    UpsertPointsBuilder, VectorParams, WithPayloadSelector,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Which index holds the chunk embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorStoreKind {
    /// Brute-force cosine search in process memory
    #[default]
    Memory,
    /// A Qdrant collection
    Qdrant,
}

impl FromStr for VectorStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(VectorStoreKind::Memory),
            "qdrant" => Ok(VectorStoreKind::Qdrant),
            other => Err(format!(
                "unknown vector store '{}', expected 'memory' or 'qdrant'",
                other
            )),
        }
    }
}

impl fmt::Display for VectorStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorStoreKind::Memory => f.write_str("memory"),
            VectorStoreKind::Qdrant => f.write_str("qdrant"),
        }
    }
}

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let url = env::var("QDRANT_URL").context("Missing QDRANT_URL")?;
        let api_key = env::var("QDRANT_API_KEY").ok();

        Ok(QdrantConfig { url, api_key })
    }
}

/// How to open a fresh vector store for each processed document
#[derive(Debug, Clone, Default)]
pub enum VectorStoreConfig {
    #[default]
    Memory,
    Qdrant(QdrantConfig),
}

impl VectorStoreConfig {
    /// Resolve the backend kind, reading the Qdrant settings from the environment when needed
    pub fn for_kind(kind: VectorStoreKind) -> Result<Self> {
        match kind {
            VectorStoreKind::Memory => Ok(VectorStoreConfig::Memory),
            VectorStoreKind::Qdrant => Ok(VectorStoreConfig::Qdrant(QdrantConfig::from_env()?)),
        }
    }

    pub async fn open(&self) -> Result<VectorStore> {
        match self {
            VectorStoreConfig::Memory => Ok(VectorStore::Memory(InMemoryStore::default())),
            VectorStoreConfig::Qdrant(config) => Ok(VectorStore::Qdrant(
                QdrantClient::new(config.clone())
                    .await
                    .context("Failed to initialize Qdrant client")?,
            )),
        }
    }
}

/// Chunk index for the current document
pub enum VectorStore {
    Memory(InMemoryStore),
    Qdrant(QdrantClient),
}

impl VectorStore {
    /// Replace whatever the store holds with the chunks of one document
    pub async fn rebuild(
        &mut self,
        document_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> Result<()> {
        ensure!(
            chunks.len() == embeddings.len(),
            "Chunk count ({}) doesn't match embedding count ({})",
            chunks.len(),
            embeddings.len()
        );

        match self {
            VectorStore::Memory(store) => store.rebuild(chunks, embeddings),
            VectorStore::Qdrant(client) => {
                client.replace_document(document_id, chunks, embeddings).await
            }
        }
    }

    /// Chunks most similar to the query, best match first
    pub async fn search(&self, query: &Embedding, limit: usize) -> Result<Vec<TextChunk>> {
        match self {
            VectorStore::Memory(store) => store.search(query, limit),
            VectorStore::Qdrant(client) => client.search(query, limit).await,
        }
    }
}

/// Brute-force cosine index kept in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Vec<(TextChunk, Embedding)>,
}

impl InMemoryStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rebuild(&mut self, chunks: Vec<TextChunk>, embeddings: Vec<Embedding>) -> Result<()> {
        if let Some(first) = embeddings.first() {
            let dimension = first.dimension();
            if let Some(bad) = embeddings.iter().find(|e| e.dimension() != dimension) {
                bail!(
                    "Dimension mismatch: expected {}, got {}",
                    dimension,
                    bad.dimension()
                );
            }
        }

        self.entries = chunks.into_iter().zip(embeddings).collect();
        info!("In-memory index rebuilt with {} chunks", self.entries.len());
        Ok(())
    }

    pub fn search(&self, query: &Embedding, limit: usize) -> Result<Vec<TextChunk>> {
        if let Some((_, stored)) = self.entries.first() {
            ensure!(
                stored.dimension() == query.dimension(),
                "Dimension mismatch: expected {}, got {}",
                stored.dimension(),
                query.dimension()
            );
        }

        let mut scored: Vec<(f32, &TextChunk)> = self
            .entries
            .iter()
            .map(|(chunk, embedding)| (query.cosine_similarity(embedding), chunk))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, chunk)| {
                debug!("chunk at {} scored {:.4}", chunk.start_position, score);
                chunk.clone()
            })
            .collect())
    }
}

/// Client for interacting with Qdrant
pub struct QdrantClient {
    client: Qdrant,
    collection_name: Option<String>,
}

impl QdrantClient {
    /// Create a new Qdrant client
    pub async fn new(config: QdrantConfig) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder.build()?;

        Ok(QdrantClient {
            client,
            collection_name: None,
        })
    }

    /// Check if the collection for a document exists
    pub async fn collection_exists(&self, document_id: &str) -> Result<bool> {
        let collection_name = get_collection_name(document_id);
        self.client
            .collection_exists(collection_name.clone())
            .await
            .with_context(|| format!("Failed to check collection {}", collection_name))
    }

    /// Drop the previous document's collection and index a new one
    pub async fn replace_document(
        &mut self,
        document_id: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> Result<()> {
        if let Some(previous) = self.collection_name.take() {
            self.delete_collection(&previous).await?;
        }

        let dimension = embeddings
            .first()
            .map(Embedding::dimension)
            .context("No chunks to index")?;

        let collection_name = get_collection_name(document_id);
        if self.collection_exists(document_id).await? {
            self.delete_collection(&collection_name).await?;
        }

        self.create_collection(&collection_name, dimension as u64)
            .await?;
        self.collection_name = Some(collection_name.clone());
        self.store_chunks(&collection_name, chunks, embeddings)
            .await
    }

    async fn create_collection(&self, collection_name: &str, vector_size: u64) -> Result<()> {
        let create_collection = CreateCollectionBuilder::new(collection_name).vectors_config(
            VectorParams {
                size: vector_size,
                distance: Distance::Cosine.into(),
                ..Default::default()
            },
        );

        self.client
            .create_collection(create_collection)
            .await
            .with_context(|| format!("Failed to create collection {}", collection_name))?;

        Ok(())
    }

    async fn delete_collection(&self, collection_name: &str) -> Result<()> {
        self.client
            .delete_collection(collection_name.to_string())
            .await
            .with_context(|| format!("Failed to delete collection {}", collection_name))?;

        Ok(())
    }

    async fn store_chunks(
        &self,
        collection_name: &str,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
    ) -> Result<()> {
        let points = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(idx, (chunk, embedding))| -> Result<PointStruct> {
                let payload = Payload::try_from(json!({
                    "text": chunk.text,
                    "document_id": chunk.document_id,
                    "start_position": chunk.start_position,
                    "chunk_index": idx,
                }))?;

                Ok(PointStruct::new(idx as u64, embedding.values, payload))
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Upserting {} points into {}", points.len(), collection_name);
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_name, points).wait(true))
            .await
            .with_context(|| {
                format!("Failed to upsert points in collection {}", collection_name)
            })?;

        Ok(())
    }

    /// Search the current collection for relevant chunks
    pub async fn search(&self, query_embedding: &Embedding, limit: usize) -> Result<Vec<TextChunk>> {
        let collection_name = self
            .collection_name
            .clone()
            .context("No document has been indexed in Qdrant")?;

        let search_request = SearchPoints {
            collection_name: collection_name.clone(),
            vector: query_embedding.values.clone(),
            limit: limit as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(with_payload_selector::SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_response = self
            .client
            .search_points(search_request)
            .await
            .with_context(|| format!("Failed to search collection {}", collection_name))?;

        // Convert search results back to TextChunks
        let chunks = search_response
            .result
            .into_iter()
            .filter_map(|scored_point| {
                let payload = scored_point.payload;
                let text = payload.get("text")?.as_str()?.to_string();
                let document_id = payload
                    .get("document_id")
                    .and_then(|v| v.as_str())
                    .cloned()
                    .unwrap_or_default();
                let start_position = payload
                    .get("start_position")
                    .and_then(|v| v.as_integer())
                    .map(|v| v as usize)
                    .unwrap_or(0);

                Some(TextChunk {
                    token_count: crate::chunking::estimate_token_count(&text),
                    text,
                    document_id,
                    start_position,
                })
            })
            .collect();

        Ok(chunks)
    }
}

/// Generate a collection name from a file name
fn get_collection_name(file_name: &str) -> String {
    // Replace non-alphanumeric characters with underscores and convert to lowercase
    let name = file_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, start_position: usize) -> TextChunk {
        TextChunk {
            text: text.to_string(),
            token_count: 1,
            document_id: "doc.txt".to_string(),
            start_position,
        }
    }

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_in_memory_search_ranks_by_similarity() {
        let mut store = InMemoryStore::default();
        store
            .rebuild(
                vec![chunk("north", 0), chunk("east", 10), chunk("north-east", 20)],
                vec![
                    embedding(&[0.0, 1.0]),
                    embedding(&[1.0, 0.0]),
                    embedding(&[1.0, 1.0]),
                ],
            )
            .unwrap();

        let hits = store.search(&embedding(&[0.1, 1.0]), 2).unwrap();
        let texts: Vec<&str> = hits.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["north", "north-east"]);
    }

    #[test]
    fn test_in_memory_rebuild_replaces_previous_document() {
        let mut store = InMemoryStore::default();
        store
            .rebuild(vec![chunk("old", 0)], vec![embedding(&[1.0, 0.0])])
            .unwrap();
        store
            .rebuild(
                vec![chunk("new a", 0), chunk("new b", 6)],
                vec![embedding(&[1.0, 0.0]), embedding(&[0.0, 1.0])],
            )
            .unwrap();

        assert_eq!(store.len(), 2);
        let hits = store.search(&embedding(&[1.0, 0.0]), 5).unwrap();
        assert!(hits.iter().all(|c| c.text != "old"));
    }

    #[test]
    fn test_in_memory_dimension_checks() {
        let mut store = InMemoryStore::default();
        assert!(store
            .rebuild(
                vec![chunk("a", 0), chunk("b", 1)],
                vec![embedding(&[1.0]), embedding(&[1.0, 2.0])],
            )
            .is_err());

        store
            .rebuild(vec![chunk("a", 0)], vec![embedding(&[1.0, 0.0])])
            .unwrap();
        assert!(store.search(&embedding(&[1.0, 0.0, 0.0]), 1).is_err());
    }

    #[test]
    fn test_empty_store_returns_no_hits() {
        let store = InMemoryStore::default();
        assert!(store.is_empty());
        assert!(store.search(&embedding(&[1.0]), 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_rejects_count_mismatch() {
        let mut store = VectorStoreConfig::Memory.open().await.unwrap();
        let result = store
            .rebuild("doc.txt", vec![chunk("a", 0)], Vec::new())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_vector_store_kind_from_str() {
        assert_eq!("memory".parse(), Ok(VectorStoreKind::Memory));
        assert_eq!("Qdrant".parse(), Ok(VectorStoreKind::Qdrant));
        assert!("faiss".parse::<VectorStoreKind>().is_err());
    }

    #[test]
    fn test_collection_name() {
        assert_eq!(get_collection_name("My Report.PDF"), "rag_my_report_pdf");
    }
}
