use crate::services::key_pool::{
    call_with_failover, classify_response, classify_transport, KeyPool, ProviderFailure,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const RERANK_TIMEOUT: Duration = Duration::from_secs(7);

/// One reranked document: index into the input array plus relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub index: usize,
    pub score: f32,
}

/// Second-stage reordering of a candidate set against the query.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns at most `top_k` entries ordered by descending score, ties
    /// broken by ascending original index.
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize)
        -> Result<Vec<RankedEntry>>;
}

#[derive(Debug, Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Clone)]
pub struct RerankClient {
    client: Client,
    base_url: String,
    model: String,
    keys: Arc<KeyPool>,
}

impl RerankClient {
    pub fn new(base_url: String, model: String, keys: Arc<KeyPool>) -> Self {
        Self {
            client: Client::builder()
                .timeout(RERANK_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url,
            model,
            keys,
        }
    }

    async fn request_rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
        api_key: &str,
    ) -> Result<Vec<RankedEntry>, ProviderFailure> {
        let request = RerankRequest {
            model: self.model.clone(),
            query: query.to_string(),
            documents: documents.to_vec(),
            top_n: top_k,
        };

        let url = format!("{}/v1/rerank", self.base_url);

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

        let parsed: RerankResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderFailure::Fatal(format!("unparseable rerank response: {}", e)))?;

        let entries = parsed
            .results
            .into_iter()
            .filter(|r| r.index < documents.len())
            .map(|r| RankedEntry {
                index: r.index,
                score: r.relevance_score,
            })
            .collect();

        Ok(order_entries(entries, top_k, documents.len()))
    }
}

/// Descending score, stable ties by ascending index, length capped at
/// `min(top_k, document_count)`.
fn order_entries(mut entries: Vec<RankedEntry>, top_k: usize, document_count: usize) -> Vec<RankedEntry> {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
    });
    entries.truncate(top_k.min(document_count));
    entries
}

#[async_trait]
impl Reranker for RerankClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RankedEntry>> {
        if documents.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        debug!(
            "Reranking {} documents (top_k={}) with model {}",
            documents.len(),
            top_k,
            self.model
        );

        let entries = call_with_failover(&self.keys, "rerank", |key| async move {
            self.request_rerank(query, documents, top_k, &key).await
        })
        .await
        .context("Rerank provider call failed")?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_descending_score() {
        let entries = vec![
            RankedEntry { index: 0, score: 0.2 },
            RankedEntry { index: 1, score: 0.9 },
            RankedEntry { index: 2, score: 0.5 },
        ];
        let ordered = order_entries(entries, 3, 3);
        assert_eq!(
            ordered.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2, 0]
        );
    }

    #[test]
    fn ties_break_by_ascending_index() {
        let entries = vec![
            RankedEntry { index: 3, score: 0.5 },
            RankedEntry { index: 1, score: 0.5 },
            RankedEntry { index: 2, score: 0.5 },
        ];
        let ordered = order_entries(entries, 3, 4);
        assert_eq!(
            ordered.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn truncates_to_top_k_and_document_count() {
        let entries = vec![
            RankedEntry { index: 0, score: 0.9 },
            RankedEntry { index: 1, score: 0.8 },
            RankedEntry { index: 2, score: 0.7 },
        ];
        assert_eq!(order_entries(entries.clone(), 2, 3).len(), 2);
        assert_eq!(order_entries(entries, 10, 3).len(), 3);
    }
}
