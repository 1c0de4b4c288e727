//! Text embedding: token budgeting, sentence chunking with overlap, and
//! batch encoding through a 384-dimension sentence encoder.
//!
//! Encoding goes through an OpenAI-compatible `/embeddings` endpoint (Ollama
//! serves one for `all-minilm`); the chunking policy runs in-process.

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Conservative token ceiling for a 512-token sentence encoder.
pub const MAX_TOKENS: usize = 400;
/// Overlap budget carried between consecutive chunks (~25%).
pub const CHUNK_OVERLAP_TOKENS: usize = 100;

/// Turns batches of text into fixed-dimension vectors.
#[async_trait]
pub trait SentenceEncoder: Send + Sync {
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible `/embeddings` HTTP encoder.
pub struct HttpEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl HttpEncoder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        }
    }
}

#[async_trait]
impl SentenceEncoder for HttpEncoder {
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let payload = json!({"model": self.model, "input": texts});

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("embedding request failed: {}", e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("embedding response was not JSON: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Embedding(format!(
                "embedding server returned {}: {}",
                status, body
            )));
        }

        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Embedding("embedding response missing data".to_string()))?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let raw = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::Embedding("embedding item missing vector".to_string()))?;
            let vector: Vec<f32> = raw
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vector.len() != self.dimension {
                return Err(Error::Embedding(format!(
                    "expected {}-dimension embedding, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
            vectors.push(normalize(vector));
        }

        if vectors.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                vectors.len()
            )));
        }

        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// L2-normalizes so cosine similarity reduces to a dot product.
fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Result of embedding one email: a single vector for short messages, or an
/// ordered chunk set for long ones. Never both.
#[derive(Debug, Clone)]
pub enum EmailEmbedding {
    Single(Vec<f32>),
    Chunked(Vec<(String, Vec<f32>)>),
}

pub struct Embedder {
    encoder: Arc<dyn SentenceEncoder>,
}

impl Embedder {
    pub fn new(encoder: Arc<dyn SentenceEncoder>) -> Self {
        Self { encoder }
    }

    pub fn model_name(&self) -> &str {
        self.encoder.model_name()
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    /// Embeds one text, truncated to the token budget.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let truncated = truncate_to_tokens(text, MAX_TOKENS);
        let mut vectors = self.encoder.encode_batch(&[truncated]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("encoder returned no vector".to_string()))
    }

    /// Batch embedding; preferred for throughput.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_to_tokens(t, MAX_TOKENS))
            .collect();
        self.encoder.encode_batch(&truncated).await
    }

    /// Embeds an email with the adaptive chunking strategy: a single vector
    /// when the canonical text fits the budget, overlapping chunks otherwise.
    pub async fn embed_email(
        &self,
        subject: &str,
        body: &str,
        from_addr: Option<&str>,
    ) -> Result<EmailEmbedding> {
        let email_text = prepare_email_text(subject, body, from_addr);
        let token_count = estimate_tokens(&email_text);

        if token_count <= MAX_TOKENS {
            debug!(tokens = token_count, "embedding email as single vector");
            let vector = self.embed_text(&email_text).await?;
            return Ok(EmailEmbedding::Single(vector));
        }

        let chunks = chunk_text_with_overlap(&email_text);
        debug!(tokens = token_count, chunks = chunks.len(), "embedding email as chunks");
        let vectors = self.embed_batch(&chunks).await?;
        Ok(EmailEmbedding::Chunked(
            chunks.into_iter().zip(vectors).collect(),
        ))
    }
}

/// Canonical embedding text: subject, sender, cleaned body.
pub fn prepare_email_text(subject: &str, body: &str, from_addr: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !subject.is_empty() {
        parts.push(format!("Subject: {}", subject));
    }
    if let Some(from_addr) = from_addr.filter(|f| !f.is_empty()) {
        parts.push(format!("From: {}", from_addr));
    }
    let body = clean_text(body);
    if !body.is_empty() {
        parts.push(body);
    }
    parts.join("\n\n")
}

/// Collapses runs of blank lines and spaces.
fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    let mut spaces = 0usize;

    for ch in text.chars() {
        match ch {
            '\n' => {
                newlines += 1;
                spaces = 0;
                if newlines <= 2 {
                    out.push('\n');
                }
            }
            ' ' => {
                spaces += 1;
                newlines = 0;
                if spaces <= 1 {
                    out.push(' ');
                }
            }
            _ => {
                newlines = 0;
                spaces = 0;
                out.push(ch);
            }
        }
    }

    out.trim().to_string()
}

/// Rough token estimate: 1 token ≈ 4 characters. The encoder tokenizes
/// exactly on its side; this only drives the chunking policy.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Splits on sentence boundaries (terminal punctuation followed by
/// whitespace). Pathological input without boundaries comes back whole.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            // Swallow any run of terminal punctuation, then split on whitespace
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek().is_some_and(|c| c.is_whitespace()) {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    if sentences.is_empty() {
        vec![text.to_string()]
    } else {
        sentences
    }
}

/// Greedy sentence accumulation: emit on overflow, seed the next chunk with
/// the trailing sentences of the previous one up to the overlap budget.
/// Every emitted chunk is cut to the token ceiling, so a single sentence
/// that alone exceeds the budget cannot escape it. Consecutive chunks share
/// a boundary-spanning prefix.
pub fn chunk_text_with_overlap(text: &str) -> Vec<String> {
    let sentences = split_into_sentences(text);

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;

    for sentence in sentences {
        let sentence_tokens = estimate_tokens(&sentence);

        if current_tokens + sentence_tokens > MAX_TOKENS && !current.is_empty() {
            chunks.push(truncate_to_tokens(&current.join(" "), MAX_TOKENS));

            let overlap = overlap_sentences(&current, CHUNK_OVERLAP_TOKENS);
            current = overlap;
            current.push(sentence);
            current_tokens = current.iter().map(|s| estimate_tokens(s)).sum();
        } else {
            current_tokens += sentence_tokens;
            current.push(sentence);
        }
    }

    if !current.is_empty() {
        chunks.push(truncate_to_tokens(&current.join(" "), MAX_TOKENS));
    }

    if chunks.is_empty() {
        vec![truncate_to_tokens(text, MAX_TOKENS)]
    } else {
        chunks
    }
}

/// Trailing sentences whose combined estimate fits the overlap budget.
fn overlap_sentences(sentences: &[String], overlap_tokens: usize) -> Vec<String> {
    let mut overlap = Vec::new();
    let mut token_count = 0usize;

    for sentence in sentences.iter().rev() {
        let sentence_tokens = estimate_tokens(sentence);
        if token_count + sentence_tokens <= overlap_tokens {
            overlap.insert(0, sentence.clone());
            token_count += sentence_tokens;
        } else {
            break;
        }
    }

    overlap
}

/// Deterministic offline encoder, shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// Deterministic offline encoder for tests: hashes character n-grams into
    /// a fixed-dimension vector. Similar strings get similar vectors.
    pub struct StubEncoder {
        pub dimension: usize,
    }

    impl Default for StubEncoder {
        fn default() -> Self {
            Self { dimension: 384 }
        }
    }

    #[async_trait]
    impl SentenceEncoder for StubEncoder {
        async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vector = vec![0.0f32; self.dimension];
                    for (i, window) in text.as_bytes().windows(3).enumerate() {
                        let bucket = (window[0] as usize * 31
                            + window[1] as usize * 7
                            + window[2] as usize
                            + i % 3)
                            % self.dimension;
                        vector[bucket] += 1.0;
                    }
                    normalize(vector)
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            "stub-encoder"
        }
    }
}
