//! Request orchestration: authorize a chat request, resolve its models,
//! run retrieval + generation with out-of-band document capture, persist
//! history, and deliver the reply through a response sink.
//!
//! External collaborators (registry, catalog, retriever construction, chat
//! model construction, history store) are traits so the pipeline can be
//! exercised against fakes.

pub mod capture;
pub mod chain;
pub mod history;
pub mod pipeline;
pub mod retriever;
pub mod sink;

pub use capture::{document_capture, CaptureHandle, DocumentCapture};
pub use chain::ConversationChain;
pub use history::{extend_history, group_turns};
pub use pipeline::{authorize, resolve_models, run_turn};
pub use retriever::{BackendRetrieverFactory, RetrieverKind};
pub use sink::{BufferedSink, EventSink, ResponseSink, SinkClosed, StreamEvent};

use crate::database::models::{Bot, ModelInfo, ModelProvider};
use crate::models::{ChatMessage, SourceDocument};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Which catalog namespace a model name is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Embedding,
    Chat,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy of one chat request. Auth failures always surface as
/// HTTP errors; `MissingModel` surfaces as an HTTP error in streaming mode
/// but as a soft in-band payload in one-shot mode (handler's decision, not
/// this module's). Everything else collapses to a generic 500.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("bot not found")]
    BotNotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("no {0} model configured")]
    MissingModel(ModelKind),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

/// Resolves a public bot identifier to its configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BotRegistry: Send + Sync {
    async fn resolve_bot(&self, public_id: &str) -> Result<Option<Bot>>;
}

/// Resolves a named model of a given kind to provider + configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn resolve_model_info(&self, name: &str, kind: ModelKind) -> Result<Option<ModelInfo>>;
}

/// Returns ranked supporting documents for a query. A built retriever is
/// additionally wired to a [`CaptureHandle`] it resolves with the final
/// ranked list on every successful retrieval.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>>;
}

/// Builds a retriever of the selected kind for one request.
pub trait RetrieverFactory: Send + Sync {
    fn build(
        &self,
        kind: RetrieverKind,
        embedding: &ModelInfo,
        bot_id: i32,
        capture: CaptureHandle,
    ) -> Arc<dyn Retriever>;
}

/// Embeds query text; built per request from the resolved embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Produces an [`Embedder`] for a resolved embedding model.
pub trait EmbeddingProvider: Send + Sync {
    fn for_model(&self, info: &ModelInfo) -> Arc<dyn Embedder>;
}

/// Bot-scoped document search, behind both retriever variants.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn vector_search(
        &self,
        bot_id: i32,
        embedding: Vec<f32>,
        limit: i32,
    ) -> Result<Vec<SourceDocument>>;

    async fn hybrid_search(
        &self,
        bot_id: i32,
        embedding: Vec<f32>,
        query: &str,
        limit: i32,
    ) -> Result<Vec<SourceDocument>>;
}

/// Receives each token of a streamed completion in generation order.
pub type TokenSink = mpsc::UnboundedSender<String>;

/// Everything needed to build one chat model client.
#[derive(Clone)]
pub struct ChatModelSpec {
    pub provider: ModelProvider,
    pub model: String,
    pub temperature: f32,
    pub config: serde_json::Value,
    /// Per-bot credential override, already capability-checked by the
    /// pipeline; `None` means the provider default applies.
    pub api_key: Option<String>,
    /// Present only on the streaming answer client.
    pub token_sink: Option<TokenSink>,
}

/// A callable chat model client.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String>;
}

/// Instantiates chat model clients.
pub trait ChatModelProvider: Send + Sync {
    fn build(&self, spec: ChatModelSpec) -> Arc<dyn ChatModel>;
}

/// One durably recorded exchange, keyed by caller API key and bot id.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub api_key: String,
    pub bot_id: i32,
    pub human: String,
    pub bot: String,
}

/// Durably appends one exchange record.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> Result<()>;
}

/// The collaborator set one request is orchestrated against.
#[derive(Clone)]
pub struct ChatDeps {
    pub registry: Arc<dyn BotRegistry>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub retrievers: Arc<dyn RetrieverFactory>,
    pub chat_models: Arc<dyn ChatModelProvider>,
    pub history: Arc<dyn HistoryStore>,
}

/// Models resolved for one request; never cached across requests.
#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub embedding: ModelInfo,
    pub chat: ModelInfo,
}
