//! Shared helpers for database-backed integration tests.
//!
//! These tests need a PostgreSQL server with the pgvector extension, reachable
//! through the usual MAILMIND__DATABASE__* configuration. They are `#[ignore]`d
//! so the default suite passes without one; run them with
//! `cargo test -- --ignored --test-threads=1` (the classify pass sweeps every
//! unclassified row, so tests must not interleave).

use mailmind::models::message::MailMessage;
use mailmind::{DbPool, load_config};
use std::sync::atomic::{AtomicU64, Ordering};

static SEQ: AtomicU64 = AtomicU64::new(0);

pub async fn init_test_db() -> DbPool {
    let config = load_config().expect("Failed to load config");
    mailmind::init_db(&config)
        .await
        .expect("Failed to connect to test database (is Postgres with pgvector running?)")
}

/// A unique id namespace per call so tests do not trample each other.
pub fn test_id(prefix: &str) -> String {
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("test_{}_{}_{}", prefix, std::process::id(), n)
}

pub fn make_message(id: &str, subject: &str, from_addr: &str, internal_date: i64) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        thread_id: Some(format!("{}_thread", id)),
        from_addr: Some(from_addr.to_string()),
        to_addr: Some("me@example.com".to_string()),
        subject: Some(subject.to_string()),
        snippet: Some(format!("snippet for {}", subject)),
        labels: Some(vec!["INBOX".to_string()]),
        internal_date: Some(internal_date),
        payload: Some(serde_json::json!({
            "mimeType": "text/plain",
            "headers": [{"name": "From", "value": from_addr}],
        })),
        ..Default::default()
    }
}

/// Removes every row whose message id carries the given test prefix.
pub async fn cleanup_messages(pool: &DbPool, prefix: &str) {
    let pattern = format!("{}%", prefix);
    sqlx::query("UPDATE messages SET latest_classification_id = NULL WHERE id LIKE $1")
        .bind(&pattern)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM classifications WHERE message_id LIKE $1")
        .bind(&pattern)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM messages WHERE id LIKE $1")
        .bind(&pattern)
        .execute(pool)
        .await
        .ok();
}
