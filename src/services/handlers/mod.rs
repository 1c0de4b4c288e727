//! The eight query handlers and their shared plumbing.
//!
//! Each handler consumes `(question, limit, chat_history)` through a
//! [`HandlerContext`] and returns the uniform [`QueryResponse`] contract.
//! Handlers never propagate failures to the caller: anything unrecoverable
//! becomes a none-confidence apology answer.

pub mod aggregation;
pub mod attachment;
pub mod classification;
pub mod conversation;
pub mod semantic;
pub mod sender;
pub mod temporal;

use crate::DbPool;
use crate::error::Result;
use crate::models::chat::{ChatRole, ChatTurn, Source};
use crate::models::message::MailMessage;
use crate::services::embedding::Embedder;
use crate::services::llm::LlmGateway;
use crate::services::reranker::CrossEncoder;
use std::sync::Arc;

/// Everything a handler needs: storage pool plus the shared model services.
/// The cross-encoder and embedder are process-wide and read-only here.
pub struct HandlerContext {
    pub pool: DbPool,
    pub llm: Arc<LlmGateway>,
    pub embedder: Arc<Embedder>,
    pub reranker: Arc<CrossEncoder>,
}

impl HandlerContext {
    pub async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool.acquire().await.map_err(crate::error::Error::Sqlx)
    }
}

/// Formats messages into source metadata; non-semantic handlers report a
/// fixed similarity of 1.0.
pub fn format_sources(emails: &[MailMessage], similarity: f64) -> Vec<Source> {
    emails
        .iter()
        .map(|msg| Source {
            message_id: msg.id.clone(),
            subject: msg.subject.clone(),
            from: msg.from_addr.clone(),
            snippet: msg.snippet.clone(),
            similarity,
            date: msg.internal_date,
        })
        .collect()
}

pub fn format_scored_sources(emails: &[(MailMessage, f64)]) -> Vec<Source> {
    emails
        .iter()
        .map(|(msg, score)| Source {
            message_id: msg.id.clone(),
            subject: msg.subject.clone(),
            from: msg.from_addr.clone(),
            snippet: msg.snippet.clone(),
            similarity: *score,
            date: msg.internal_date,
        })
        .collect()
}

/// Formats the last three exchanges for prompt inclusion.
pub fn format_chat_history(chat_history: &[ChatTurn]) -> String {
    if chat_history.is_empty() {
        return String::new();
    }

    let recent = &chat_history[chat_history.len().saturating_sub(6)..];
    let mut formatted = String::from("\n\nPrevious conversation:\n");
    for turn in recent {
        let role = match turn.role {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        formatted.push_str(&format!("{}: {}\n", role, turn.content));
    }
    formatted
}

/// Strips common LLM preambles, markdown, and wrapping punctuation from a
/// short extraction reply.
pub fn clean_extraction_reply(reply: &str, prefixes: &[&str]) -> String {
    let mut cleaned = reply.trim().to_string();

    let mut lowered = cleaned.to_lowercase();
    for prefix in prefixes {
        if lowered.starts_with(prefix) {
            cleaned = cleaned[prefix.len()..].trim().to_string();
            lowered = cleaned.to_lowercase();
        }
    }

    cleaned = cleaned
        .replace("**", "")
        .replace('*', "")
        .replace("__", "")
        .replace('_', " ");

    // Peel alternating layers of punctuation and whitespace
    let mut s = cleaned.trim();
    loop {
        let peeled = s.trim_matches(|c: char| "\"'.,:;".contains(c)).trim();
        if peeled == s {
            break;
        }
        s = peeled;
    }
    s.to_string()
}
