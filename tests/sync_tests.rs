//! Sync controller tests: single-flight guards, pull idempotency, and the
//! classify+embed pass, driven by a stub mail provider and the rules
//! classifier. Database-backed; run with `cargo test -- --ignored`.

mod common;

use async_trait::async_trait;
use common::{cleanup_messages, init_test_db, test_id};
use mailmind::config::LlmConfig;
use mailmind::error::Result;
use mailmind::queries::{classifications, messages};
use mailmind::services::embedding::Embedder;
use mailmind::services::embedding::testing::StubEncoder;
use mailmind::services::llm::LlmGateway;
use mailmind::services::mail::{HistoryDelta, MailClient};
use mailmind::services::sync::{SyncController, SyncStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Canned mail provider. `delay` slows every call down so single-flight
/// transitions are observable.
struct StubMailClient {
    ids: Vec<String>,
    delay: Duration,
}

impl StubMailClient {
    fn new(ids: Vec<String>) -> Self {
        Self {
            ids,
            delay: Duration::from_millis(0),
        }
    }

    fn slow(ids: Vec<String>, delay: Duration) -> Self {
        Self { ids, delay }
    }

    fn canned_message(id: &str) -> Value {
        json!({
            "id": id,
            "threadId": format!("{}_thread", id),
            "snippet": format!("Your invoice for order {} is attached.", id),
            "labelIds": ["INBOX", "UNREAD"],
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "From", "value": "billing@shop.example"},
                    {"name": "Subject", "value": format!("Invoice {}", id)}
                ],
                "body": {"data": "WW91ciBwYXltZW50IGlzIGR1ZS4"}
            }
        })
    }
}

#[async_trait]
impl MailClient for StubMailClient {
    async fn list_inbox_ids(&self) -> Result<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        Ok(self.ids.clone())
    }

    async fn fetch_message(&self, message_id: &str, _format: &str) -> Result<Value> {
        tokio::time::sleep(self.delay).await;
        Ok(Self::canned_message(message_id))
    }

    async fn list_history_since(&self, _history_id: &str) -> Result<HistoryDelta> {
        tokio::time::sleep(self.delay).await;
        Ok(HistoryDelta {
            added_ids: self.ids.clone(),
            history_id: Some("999".to_string()),
        })
    }

    async fn current_history_id(&self) -> Result<Option<String>> {
        Ok(Some("999".to_string()))
    }
}

async fn rules_llm() -> Arc<LlmGateway> {
    Arc::new(
        LlmGateway::new(LlmConfig {
            provider: "rules".to_string(),
            ..Default::default()
        })
        .await
        .unwrap(),
    )
}

fn stub_embedder() -> Arc<Embedder> {
    Arc::new(Embedder::new(Arc::new(StubEncoder::default())))
}

async fn wait_until_settled(controller: &Arc<SyncController>, pull: bool) {
    for _ in 0..200 {
        let progress = if pull {
            controller.pull_progress().await
        } else {
            controller.classify_progress().await
        };
        if progress.status != SyncStatus::Running && progress.status != SyncStatus::Idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("sync operation did not settle in time");
}

#[tokio::test]
#[ignore]
async fn second_start_pull_is_rejected_while_running() {
    let pool = init_test_db().await;
    let prefix = test_id("flight");
    let ids = vec![format!("{}_m1", prefix)];

    let controller = Arc::new(SyncController::new(
        pool.clone(),
        Arc::new(StubMailClient::slow(ids, Duration::from_millis(400))),
        rules_llm().await,
        stub_embedder(),
        true,
    ));

    assert!(controller.start_pull().await);
    assert!(!controller.start_pull().await, "second start must be rejected");

    // The two operations may overlap: classify can still start
    assert!(controller.start_classify().await);

    wait_until_settled(&controller, true).await;
    wait_until_settled(&controller, false).await;
    assert!(controller.start_pull().await, "restart allowed after completion");
    wait_until_settled(&controller, true).await;

    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn pull_twice_is_idempotent() {
    let pool = init_test_db().await;
    let prefix = test_id("idempotent");
    let ids: Vec<String> = (0..3).map(|i| format!("{}_m{}", prefix, i)).collect();

    let controller = Arc::new(SyncController::new(
        pool.clone(),
        Arc::new(StubMailClient::new(ids.clone())),
        rules_llm().await,
        stub_embedder(),
        true,
    ));

    assert!(controller.start_pull().await);
    wait_until_settled(&controller, true).await;
    let first = controller.pull_progress().await;
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(first.processed, 3);
    assert_eq!(first.errors, 0);

    // Nothing new on the provider: the second pull processes zero
    assert!(controller.start_pull().await);
    wait_until_settled(&controller, true).await;
    let second = controller.pull_progress().await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.processed, 0);
    assert_eq!(second.errors, 0);

    cleanup_messages(&pool, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn missing_credentials_fail_the_pull_with_a_message() {
    let pool = init_test_db().await;

    let controller = Arc::new(SyncController::new(
        pool,
        Arc::new(StubMailClient::new(Vec::new())),
        rules_llm().await,
        stub_embedder(),
        false,
    ));

    assert!(controller.start_pull().await);
    wait_until_settled(&controller, true).await;

    let progress = controller.pull_progress().await;
    assert_eq!(progress.status, SyncStatus::Error);
    assert!(progress.error_message.unwrap().contains("credentials"));
}

#[tokio::test]
#[ignore]
async fn classify_pass_classifies_and_embeds_each_message() {
    let pool = init_test_db().await;
    let prefix = test_id("classify");
    let ids: Vec<String> = (0..2).map(|i| format!("{}_m{}", prefix, i)).collect();

    let controller = Arc::new(SyncController::new(
        pool.clone(),
        Arc::new(StubMailClient::new(ids.clone())),
        rules_llm().await,
        stub_embedder(),
        true,
    ));

    assert!(controller.start_pull().await);
    wait_until_settled(&controller, true).await;

    assert!(controller.start_classify().await);
    wait_until_settled(&controller, false).await;
    let progress = controller.classify_progress().await;
    assert_eq!(progress.status, SyncStatus::Completed);
    assert_eq!(progress.processed + progress.errors, 2);

    let mut conn = pool.acquire().await.unwrap();
    for id in &ids {
        // Rule-based classifier labels the invoice bodies as finance
        let latest = classifications::get_latest(&mut conn, id).await.unwrap();
        let latest = latest.expect("message should be classified");
        assert!(latest.labels.contains(&"finance".to_string()));
        assert_eq!(latest.model.as_deref(), Some("rules"));

        // Short canned bodies embed as a single vector
        assert!(
            messages::get_message_embedding(&mut conn, id).await.unwrap().is_some(),
            "message should carry an embedding"
        );
    }

    // Everything classified: nothing left for a second pass
    let unclassified = messages::get_unclassified_message_ids(&mut conn).await.unwrap();
    assert!(!unclassified.iter().any(|id| id.starts_with(&prefix)));

    drop(conn);
    cleanup_messages(&pool, &prefix).await;
}
