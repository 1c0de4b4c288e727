//! Cross-encoder reranking over an HTTP scoring service.
//!
//! The scorer is initialized lazily, once per process. If the endpoint is
//! unconfigured or the first contact fails, a sentinel disables reranking for
//! the remainder of the process and the initial ranking passes through.

use crate::error::{Error, Result};
use crate::models::message::MailMessage;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub struct CrossEncoder {
    endpoint: String,
    client: reqwest::Client,
    ready: OnceCell<bool>,
    disabled: AtomicBool,
}

impl CrossEncoder {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            ready: OnceCell::new(),
            disabled: AtomicBool::new(endpoint.trim().is_empty()),
        }
    }

    /// One-time availability probe; failure flips the permanent sentinel.
    async fn available(&self) -> bool {
        if self.disabled.load(Ordering::Relaxed) {
            return false;
        }

        *self
            .ready
            .get_or_init(|| async {
                match self
                    .client
                    .get(&self.endpoint)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                {
                    Ok(_) => {
                        info!("Cross-encoder reranker available at {}", self.endpoint);
                        true
                    }
                    Err(e) => {
                        warn!("Cross-encoder unavailable ({}), reranking disabled", e);
                        self.disabled.store(true, Ordering::Relaxed);
                        false
                    }
                }
            })
            .await
    }

    async fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        let payload = json!({"query": query, "texts": documents});
        let url = format!("{}/rerank", self.endpoint);

        let body: Value = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("rerank request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("rerank response was not JSON: {}", e)))?;

        // Response shape: [{"index": i, "score": s}, ...]
        let items = body
            .as_array()
            .ok_or_else(|| Error::Embedding("rerank response was not an array".to_string()))?;

        let mut scores = vec![0.0f64; documents.len()];
        for item in items {
            let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(u64::MAX) as usize;
            let score = item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }

    /// Scores `(question, subject + ' ' + snippet)` pairs and re-sorts,
    /// returning the top `top_k`. Unavailability or failure passes the
    /// initial ranking through untouched.
    pub async fn rerank(
        &self,
        question: &str,
        results: Vec<(MailMessage, f64)>,
        top_k: usize,
    ) -> Vec<(MailMessage, f64)> {
        if results.len() <= 1 || !self.available().await {
            return results.into_iter().take(top_k).collect();
        }

        let documents: Vec<String> = results
            .iter()
            .map(|(message, _)| {
                format!(
                    "{} {}",
                    message.subject.as_deref().unwrap_or(""),
                    message.snippet.as_deref().unwrap_or("")
                )
            })
            .collect();

        match self.score_pairs(question, &documents).await {
            Ok(scores) => {
                let mut reranked: Vec<(MailMessage, f64)> = results
                    .into_iter()
                    .zip(scores)
                    .map(|((message, _), score)| (message, score))
                    .collect();
                reranked.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                });
                reranked.into_iter().take(top_k).collect()
            }
            Err(e) => {
                warn!("Reranking failed: {}. Using original results.", e);
                results.into_iter().take(top_k).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            subject: Some(format!("subject {}", id)),
            snippet: Some(format!("snippet {}", id)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unconfigured_reranker_passes_through() {
        let reranker = CrossEncoder::new("");
        let results = vec![(message("a"), 0.9), (message("b"), 0.8), (message("c"), 0.7)];
        let reranked = reranker.rerank("question", results, 2).await;

        let ids: Vec<&str> = reranked.iter().map(|(m, _)| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_single_result_skips_reranking() {
        let reranker = CrossEncoder::new("http://127.0.0.1:1");
        let results = vec![(message("a"), 0.9)];
        let reranked = reranker.rerank("question", results, 5).await;
        assert_eq!(reranked.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_disables_for_process() {
        let reranker = CrossEncoder::new("http://127.0.0.1:1");
        let results = vec![(message("a"), 0.9), (message("b"), 0.8)];
        let reranked = reranker.rerank("q", results.clone(), 2).await;
        assert_eq!(reranked.len(), 2);
        // Sentinel is set; subsequent calls short-circuit
        assert!(reranker.disabled.load(Ordering::Relaxed));
        let again = reranker.rerank("q", results, 1).await;
        assert_eq!(again.len(), 1);
    }
}
