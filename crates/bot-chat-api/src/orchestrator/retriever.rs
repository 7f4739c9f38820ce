//! Retriever variants over the bot-scoped search backend. Both embed the
//! query, delegate ranking to the backend, and resolve the turn's document
//! capture with the final ranked list.

use super::capture::CaptureHandle;
use super::{Embedder, EmbeddingProvider, Retriever, RetrieverFactory, SearchBackend};
use crate::database::models::ModelInfo;
use crate::models::SourceDocument;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieverKind {
    /// Lexical + vector ranking combined by the backend.
    Hybrid,
    /// Pure vector top-k over the bot's index.
    Vector,
}

pub struct HybridRetriever {
    search: Arc<dyn SearchBackend>,
    embedder: Arc<dyn Embedder>,
    bot_id: i32,
    top_k: i32,
    capture: CaptureHandle,
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
        let embedding = self.embedder.embed(query).await?;
        let documents = self
            .search
            .hybrid_search(self.bot_id, embedding, query, self.top_k)
            .await?;

        debug!(bot_id = self.bot_id, count = documents.len(), "hybrid retrieval done");
        self.capture.resolve(documents.clone());
        Ok(documents)
    }
}

pub struct VectorRetriever {
    search: Arc<dyn SearchBackend>,
    embedder: Arc<dyn Embedder>,
    bot_id: i32,
    top_k: i32,
    capture: CaptureHandle,
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
        let embedding = self.embedder.embed(query).await?;
        let documents = self
            .search
            .vector_search(self.bot_id, embedding, self.top_k)
            .await?;

        debug!(bot_id = self.bot_id, count = documents.len(), "vector retrieval done");
        self.capture.resolve(documents.clone());
        Ok(documents)
    }
}

/// Production factory: retrievers over the repository-backed search plus a
/// per-request embedding client for the resolved embedding model.
pub struct BackendRetrieverFactory {
    search: Arc<dyn SearchBackend>,
    embeddings: Arc<dyn EmbeddingProvider>,
    top_k: i32,
}

impl BackendRetrieverFactory {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        embeddings: Arc<dyn EmbeddingProvider>,
        top_k: usize,
    ) -> Self {
        Self {
            search,
            embeddings,
            top_k: top_k as i32,
        }
    }
}

impl RetrieverFactory for BackendRetrieverFactory {
    fn build(
        &self,
        kind: RetrieverKind,
        embedding: &ModelInfo,
        bot_id: i32,
        capture: CaptureHandle,
    ) -> Arc<dyn Retriever> {
        let embedder = self.embeddings.for_model(embedding);
        match kind {
            RetrieverKind::Hybrid => Arc::new(HybridRetriever {
                search: self.search.clone(),
                embedder,
                bot_id,
                top_k: self.top_k,
                capture,
            }),
            RetrieverKind::Vector => Arc::new(VectorRetriever {
                search: self.search.clone(),
                embedder,
                bot_id,
                top_k: self.top_k,
                capture,
            }),
        }
    }
}
