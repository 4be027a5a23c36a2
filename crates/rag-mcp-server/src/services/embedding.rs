use crate::services::key_pool::{
    call_with_failover, classify_response, classify_transport, KeyPool, ProviderFailure,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(7);

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Produces a unit-norm query vector for the semantic branch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    keys: Arc<KeyPool>,
}

impl EmbeddingClient {
    pub fn new(base_url: String, model: String, keys: Arc<KeyPool>) -> Self {
        Self {
            client: Client::builder()
                .timeout(EMBEDDING_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url,
            model,
            keys,
        }
    }

    async fn request_embedding(&self, text: &str, api_key: &str) -> Result<Vec<f32>, ProviderFailure> {
        let request = EmbeddingRequest {
            input: text.to_string(),
            model: self.model.clone(),
        };

        let url = format!("{}/v1/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            return Err(classify_response(status.as_u16(), &body));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderFailure::Fatal(format!("unparseable embedding response: {}", e))
        })?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderFailure::Fatal("empty data array in embedding response".to_string()))?;

        if embedding.is_empty() {
            return Err(ProviderFailure::Fatal("empty embedding vector".to_string()));
        }

        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            anyhow::bail!("EMPTY_INPUT: embedding input must not be blank");
        }

        debug!("Embedding {} chars with model {}", trimmed.len(), self.model);

        let embedding = call_with_failover(&self.keys, "embedding", |key| async move {
            self.request_embedding(trimmed, &key).await
        })
        .await
        .context("Embedding provider call failed")?;

        Ok(l2_normalize(embedding))
    }
}

/// Divide by the Euclidean norm. Zero vectors come back unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}
