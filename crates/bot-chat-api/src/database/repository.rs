use super::models::{Bot, ModelInfo, ModelProvider};
use super::DbPool;
use crate::models::SourceDocument;
use crate::orchestrator::{
    BotRegistry, HistoryRecord, HistoryStore, ModelCatalog, ModelKind, SearchBackend,
};
use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use serde_json::json;
use sqlx::FromRow;
use tracing::debug;

pub struct Repository {
    pub pool: DbPool,
}

#[derive(FromRow)]
struct ModelRow {
    model_provider: String,
    model_id: String,
    config: serde_json::Value,
}

#[derive(FromRow)]
struct ChunkRow {
    chunk_id: i64,
    document_title: String,
    content: String,
    score: f32,
    chunk_index: i32,
}

impl ChunkRow {
    fn into_document(self) -> SourceDocument {
        SourceDocument {
            content: self.content,
            metadata: json!({
                "chunk_id": self.chunk_id,
                "document_title": self.document_title,
                "similarity": self.score,
                "chunk_index": self.chunk_index,
            }),
        }
    }
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_bot_by_public_id(&self, public_id: &str) -> Result<Option<Bot>> {
        let bot = sqlx::query_as::<_, Bot>(
            r#"SELECT
                id,
                public_id,
                name,
                provider,
                model,
                embedding,
                temperature,
                use_hybrid_search,
                question_generator_prompt,
                qa_prompt,
                bot_api_key,
                bot_model_api_key
               FROM bots
               WHERE public_id = $1"#,
        )
        .bind(public_id)
        .persistent(false)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(bot)
    }

    pub async fn find_model(&self, name: &str, kind: &str) -> Result<Option<ModelInfo>> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"SELECT model_provider, model_id, config
               FROM model_catalog
               WHERE name = $1 AND kind = $2"#,
        )
        .bind(name)
        .bind(kind)
        .persistent(false)
        .fetch_optional(self.pool.get_pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let provider = ModelProvider::from_name(&row.model_provider).ok_or_else(|| {
            anyhow::anyhow!("unknown model provider in catalog: {}", row.model_provider)
        })?;

        Ok(Some(ModelInfo {
            model_provider: provider,
            model_id: row.model_id,
            config: row.config,
        }))
    }

    pub async fn insert_chat_history(
        &self,
        api_key: &str,
        bot_id: i32,
        human: &str,
        bot: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO chat_history (api_key, bot_id, human, bot)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(api_key)
        .bind(bot_id)
        .bind(human)
        .bind(bot)
        .persistent(false)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    /// Pure vector top-k over the bot's chunks.
    pub async fn vector_search_bot_documents(
        &self,
        bot_id: i32,
        query_embedding: Vector,
        limit: i32,
    ) -> Result<Vec<SourceDocument>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT
                chunk_id,
                document_title,
                content,
                score,
                chunk_index
               FROM search_bot_documents($1, $2, $3)"#,
        )
        .bind(bot_id)
        .bind(query_embedding)
        .bind(limit)
        .persistent(false)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Found {} relevant chunks for bot {}", rows.len(), bot_id);

        Ok(rows.into_iter().map(ChunkRow::into_document).collect())
    }

    /// Hybrid search: vector similarity fused with full-text rank.
    pub async fn hybrid_search_bot_documents(
        &self,
        bot_id: i32,
        query_embedding: Vector,
        query_text: &str,
        limit: i32,
    ) -> Result<Vec<SourceDocument>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT
                chunk_id,
                document_title,
                content,
                score,
                chunk_index
               FROM hybrid_search_bot_documents($1, $2, $3, $4)"#,
        )
        .bind(bot_id)
        .bind(query_embedding)
        .bind(query_text)
        .bind(limit)
        .persistent(false)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!(
            "Hybrid search found {} chunks for bot {}",
            rows.len(),
            bot_id
        );

        Ok(rows.into_iter().map(ChunkRow::into_document).collect())
    }
}

#[async_trait]
impl BotRegistry for Repository {
    async fn resolve_bot(&self, public_id: &str) -> Result<Option<Bot>> {
        self.find_bot_by_public_id(public_id).await
    }
}

#[async_trait]
impl ModelCatalog for Repository {
    async fn resolve_model_info(&self, name: &str, kind: ModelKind) -> Result<Option<ModelInfo>> {
        self.find_model(name, kind.as_str()).await
    }
}

#[async_trait]
impl HistoryStore for Repository {
    async fn append(&self, record: &HistoryRecord) -> Result<()> {
        self.insert_chat_history(&record.api_key, record.bot_id, &record.human, &record.bot)
            .await
    }
}

#[async_trait]
impl SearchBackend for Repository {
    async fn vector_search(
        &self,
        bot_id: i32,
        embedding: Vec<f32>,
        limit: i32,
    ) -> Result<Vec<SourceDocument>> {
        self.vector_search_bot_documents(bot_id, Vector::from(embedding), limit)
            .await
    }

    async fn hybrid_search(
        &self,
        bot_id: i32,
        embedding: Vec<f32>,
        query: &str,
        limit: i32,
    ) -> Result<Vec<SourceDocument>> {
        self.hybrid_search_bot_documents(bot_id, Vector::from(embedding), query, limit)
            .await
    }
}
