use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// A configured chat bot. Created and updated by the administration path;
/// read-only here and immutable for the duration of one request.
#[derive(Debug, Clone, FromRow)]
pub struct Bot {
    pub id: i32,
    pub public_id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub embedding: String,
    pub temperature: f32,
    pub use_hybrid_search: bool,
    pub question_generator_prompt: String,
    pub qa_prompt: String,
    pub bot_api_key: String,
    pub bot_model_api_key: Option<String>,
}

/// Vendor class of a model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelProvider {
    OpenaiCompatible,
    LlamaServer,
}

impl ModelProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "openai-compatible" => Some(Self::OpenaiCompatible),
            "llama-server" => Some(Self::LlamaServer),
            _ => None,
        }
    }

    /// Whether a per-bot credential may override the provider default.
    /// Adding a provider means answering this here, not comparing names at
    /// the call sites.
    pub fn supports_bot_credential(&self) -> bool {
        match self {
            Self::OpenaiCompatible => true,
            Self::LlamaServer => false,
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenaiCompatible => write!(f, "openai-compatible"),
            Self::LlamaServer => write!(f, "llama-server"),
        }
    }
}

/// Catalog entry for a named model of a given kind, resolved per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub model_provider: ModelProvider,
    pub model_id: String,
    pub config: serde_json::Value,
}
