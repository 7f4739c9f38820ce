pub mod settings;

pub use settings::{
    DatabaseConfig, EmbeddingConfig, LlmConfig, RetrievalConfig, ServerConfig, Settings,
};
