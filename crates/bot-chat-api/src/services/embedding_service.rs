//! Embedding clients. Built per request for the resolved embedding model;
//! the backend response format varies between llama.cpp and OpenAI-style
//! servers, so parsing accepts both.

use crate::config::EmbeddingConfig;
use crate::database::models::ModelInfo;
use crate::orchestrator::{Embedder, EmbeddingProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    content: String,
    input: String,
}

fn collect_floats(value: &serde_json::Value) -> Option<Vec<f32>> {
    let array = value.as_array()?;
    let floats: Vec<f32> = array
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    if floats.len() == array.len() {
        Some(floats)
    } else {
        None
    }
}

/// Accepts `{"embedding": [...]}` (llama.cpp), `{"data": [{"embedding":
/// [...]}]}` (OpenAI), and a bare float array.
fn extract_embedding(value: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = if let Some(floats) = value.get("embedding").and_then(collect_floats) {
        floats
    } else if let Some(floats) = value
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|first| first.get("embedding"))
        .and_then(collect_floats)
    {
        floats
    } else if let Some(floats) = collect_floats(value) {
        floats
    } else {
        anyhow::bail!("Unrecognized embedding response format: {}", value);
    };

    if embedding.is_empty() {
        anyhow::bail!("Generated embedding is empty");
    }

    Ok(embedding)
}

/// Builds embedding clients for resolved embedding models.
pub struct EmbeddingFactory {
    client: Client,
    defaults: EmbeddingConfig,
}

impl EmbeddingFactory {
    pub fn new(defaults: EmbeddingConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(defaults.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            defaults,
        }
    }
}

impl EmbeddingProvider for EmbeddingFactory {
    fn for_model(&self, info: &ModelInfo) -> Arc<dyn Embedder> {
        let base_url = info
            .config
            .get("base_url")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.defaults.base_url)
            .to_string();

        let dimension = info
            .config
            .get("dimension")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        Arc::new(EmbeddingClient {
            client: self.client.clone(),
            base_url,
            model: info.model_id.clone(),
            dimension,
        })
    }
}

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    dimension: Option<usize>,
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for {} chars", text.len());

        let request = EmbeddingRequest {
            model: self.model.clone(),
            // Send both field spellings for backend compatibility.
            content: text.to_string(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/embedding", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let json_value: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse embedding response as JSON")?;

        let embedding = extract_embedding(&json_value)?;

        if let Some(dimension) = self.dimension {
            if embedding.len() != dimension {
                anyhow::bail!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    dimension,
                    embedding.len()
                );
            }
        }

        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_llama_cpp_format() {
        let value = json!({"embedding": [0.1, 0.2, 0.3]});
        assert_eq!(extract_embedding(&value).unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn parses_openai_data_format() {
        let value = json!({"data": [{"embedding": [1.0, 2.0]}]});
        assert_eq!(extract_embedding(&value).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn parses_bare_array() {
        let value = json!([0.5, 0.25]);
        assert_eq!(extract_embedding(&value).unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn rejects_empty_and_unknown_shapes() {
        assert!(extract_embedding(&json!({"embedding": []})).is_err());
        assert!(extract_embedding(&json!({"vectors": [1.0]})).is_err());
        assert!(extract_embedding(&json!("nope")).is_err());
    }
}
