pub mod embedding_service;
pub mod llm_service;

pub use embedding_service::EmbeddingFactory;
pub use llm_service::LlmFactory;
