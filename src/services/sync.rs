//! Background synchronization: the Pull and Classify+Embed operations, each
//! single-flight with an in-memory progress record. Progress does not survive
//! restarts; a new run simply resumes from what storage already holds.

use crate::DbPool;
use crate::error::Result;
use crate::models::message::MailMessage;
use crate::queries::{classifications, messages, metadata};
use crate::services::classifier;
use crate::services::embedding::{EmailEmbedding, Embedder};
use crate::services::llm::LlmGateway;
use crate::services::mail::MailClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Errors beyond this many are counted but no longer logged individually.
const ERROR_LOG_LIMIT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Error,
}

/// Progress of one sync operation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub operation: &'static str,
    pub status: SyncStatus,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            status: SyncStatus::Idle,
            total: 0,
            processed: 0,
            errors: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64 * 1000.0).round() / 10.0
        }
    }
}

/// Point-in-time view across both operations plus the backlog counters.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub db_total: i64,
    pub unclassified: i64,
    pub unembedded: i64,
    pub pull: SyncProgress,
    pub classify: SyncProgress,
}

/// Cloning shares the progress records; clones observe the same operations.
#[derive(Clone)]
pub struct SyncController {
    pool: DbPool,
    mail: Arc<dyn MailClient>,
    llm: Arc<LlmGateway>,
    embedder: Arc<Embedder>,
    mail_configured: bool,
    pull: Arc<Mutex<SyncProgress>>,
    classify: Arc<Mutex<SyncProgress>>,
}

impl SyncController {
    pub fn new(
        pool: DbPool,
        mail: Arc<dyn MailClient>,
        llm: Arc<LlmGateway>,
        embedder: Arc<Embedder>,
        mail_configured: bool,
    ) -> Self {
        Self {
            pool,
            mail,
            llm,
            embedder,
            mail_configured,
            pull: Arc::new(Mutex::new(SyncProgress::new("pull"))),
            classify: Arc::new(Mutex::new(SyncProgress::new("classify"))),
        }
    }

    /// Starts the pull operation. Returns false when one is already running;
    /// the running record is left untouched.
    pub async fn start_pull(&self) -> bool {
        {
            let mut progress = self.pull.lock().await;
            if progress.status == SyncStatus::Running {
                return false;
            }
            *progress = SyncProgress::new("pull");
            progress.status = SyncStatus::Running;
            progress.started_at = Some(Utc::now());
        }

        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.run_pull().await {
                error!("Pull operation failed: {}", e);
                let mut progress = controller.pull.lock().await;
                progress.status = SyncStatus::Error;
                progress.error_message = Some(e.to_string());
                progress.completed_at = Some(Utc::now());
            }
        });

        true
    }

    /// Starts the classify+embed operation. Same single-flight contract as
    /// [`start_pull`]; the two operations may run concurrently.
    pub async fn start_classify(&self) -> bool {
        {
            let mut progress = self.classify.lock().await;
            if progress.status == SyncStatus::Running {
                return false;
            }
            *progress = SyncProgress::new("classify");
            progress.status = SyncStatus::Running;
            progress.started_at = Some(Utc::now());
        }

        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.run_classify().await {
                error!("Classify operation failed: {}", e);
                let mut progress = controller.classify.lock().await;
                progress.status = SyncStatus::Error;
                progress.error_message = Some(e.to_string());
                progress.completed_at = Some(Utc::now());
            }
        });

        true
    }

    pub async fn pull_progress(&self) -> SyncProgress {
        self.pull.lock().await.clone()
    }

    pub async fn classify_progress(&self) -> SyncProgress {
        self.classify.lock().await.clone()
    }

    /// Current database counters alongside both progress records.
    pub async fn sync_status(&self) -> Result<SyncStatusReport> {
        let mut conn = self.pool.acquire().await?;
        let db_total = messages::get_total_message_count(&mut conn).await?;
        let unclassified = messages::get_unclassified_message_ids(&mut conn).await?.len() as i64;
        let unembedded = messages::get_unembedded_message_ids(&mut conn).await?.len() as i64;
        drop(conn);

        Ok(SyncStatusReport {
            db_total,
            unclassified,
            unembedded,
            pull: self.pull_progress().await,
            classify: self.classify_progress().await,
        })
    }

    async fn run_pull(&self) -> Result<()> {
        info!("Starting mail pull operation");

        if !self.mail_configured {
            let mut progress = self.pull.lock().await;
            progress.status = SyncStatus::Error;
            progress.error_message = Some("Mail provider credentials not configured".to_string());
            progress.completed_at = Some(Utc::now());
            return Ok(());
        }

        // Incremental listing from the stored cursor where possible; an
        // expired cursor degrades to a full inbox diff
        let stored_cursor = {
            let mut conn = self.pool.acquire().await?;
            metadata::get_history_id(&mut conn).await?
        };

        let (candidate_ids, delta_cursor) = match &stored_cursor {
            Some(cursor) => match self.mail.list_history_since(cursor).await {
                Ok(delta) => (delta.added_ids, delta.history_id),
                Err(e) => {
                    warn!("History listing failed ({}), falling back to full listing", e);
                    (self.mail.list_inbox_ids().await?, None)
                }
            },
            None => (self.mail.list_inbox_ids().await?, None),
        };

        let existing: HashSet<String> = {
            let mut conn = self.pool.acquire().await?;
            messages::get_message_ids(&mut conn).await?.into_iter().collect()
        };

        let ids_to_fetch: Vec<String> = candidate_ids
            .into_iter()
            .filter(|id| !existing.contains(id))
            .collect();

        {
            let mut progress = self.pull.lock().await;
            progress.total = ids_to_fetch.len() as u64;
        }
        info!("Found {} new messages to pull", ids_to_fetch.len());

        if ids_to_fetch.is_empty() {
            self.store_cursor(delta_cursor).await;
            let mut progress = self.pull.lock().await;
            progress.status = SyncStatus::Completed;
            progress.completed_at = Some(Utc::now());
            return Ok(());
        }

        let total = ids_to_fetch.len();
        for (i, message_id) in ids_to_fetch.iter().enumerate() {
            // One save per fetch so progress is observable mid-run
            let outcome: Result<()> = async {
                let raw = self.mail.fetch_message(message_id, "full").await?;
                let mail = MailMessage::from_api_message(&raw);
                let mut conn = self.pool.acquire().await?;
                messages::save_message(&mut conn, &mail).await
            }
            .await;

            let mut progress = self.pull.lock().await;
            match outcome {
                Ok(()) => progress.processed += 1,
                Err(e) => {
                    progress.errors += 1;
                    if progress.errors <= ERROR_LOG_LIMIT {
                        error!("Error fetching message {}: {}", message_id, e);
                    } else if progress.errors == ERROR_LOG_LIMIT + 1 {
                        warn!("Suppressing further fetch error messages");
                    }
                }
            }
            drop(progress);

            if (i + 1) % 10 == 0 || i + 1 == total {
                info!("Pulled {}/{} messages", i + 1, total);
            }
        }

        self.store_cursor(delta_cursor).await;

        let mut progress = self.pull.lock().await;
        progress.status = SyncStatus::Completed;
        progress.completed_at = Some(Utc::now());
        info!(
            "Pull completed: {} messages pulled, {} errors",
            progress.processed, progress.errors
        );
        Ok(())
    }

    /// Persists the provider cursor after a pull: the history delta's cursor
    /// when one was returned, otherwise the profile's current one.
    async fn store_cursor(&self, delta_cursor: Option<String>) {
        let cursor = match delta_cursor {
            Some(cursor) => Some(cursor),
            None => match self.mail.current_history_id().await {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!("Could not read current history id: {}", e);
                    None
                }
            },
        };

        if let Some(cursor) = cursor {
            let result = async {
                let mut conn = self.pool.acquire().await?;
                metadata::set_history_id(&mut conn, &cursor).await
            }
            .await;
            if let Err(e) = result {
                warn!("Failed to store history cursor: {}", e);
            }
        }
    }

    async fn run_classify(&self) -> Result<()> {
        info!("Starting classify and embed operation");

        let unclassified_ids = {
            let mut conn = self.pool.acquire().await?;
            messages::get_unclassified_message_ids(&mut conn).await?
        };

        {
            let mut progress = self.classify.lock().await;
            progress.total = unclassified_ids.len() as u64;
        }
        info!("Found {} unclassified messages", unclassified_ids.len());

        if unclassified_ids.is_empty() {
            let mut progress = self.classify.lock().await;
            progress.status = SyncStatus::Completed;
            progress.completed_at = Some(Utc::now());
            return Ok(());
        }

        let total = unclassified_ids.len();
        for (i, message_id) in unclassified_ids.iter().enumerate() {
            let outcome = self.classify_and_embed_one(message_id).await;

            // Each message contributes exactly one to processed or errors
            let mut progress = self.classify.lock().await;
            match outcome {
                Ok(()) => progress.processed += 1,
                Err(e) => {
                    progress.errors += 1;
                    if progress.errors <= ERROR_LOG_LIMIT {
                        error!("Error processing message {}: {}", message_id, e);
                    }
                }
            }
            drop(progress);

            if (i + 1) % 5 == 0 || i + 1 == total {
                info!("Processed {}/{} messages", i + 1, total);
            }
        }

        let mut progress = self.classify.lock().await;
        progress.status = SyncStatus::Completed;
        progress.completed_at = Some(Utc::now());
        info!(
            "Classify completed: {} messages processed, {} errors",
            progress.processed, progress.errors
        );
        Ok(())
    }

    async fn classify_and_embed_one(&self, message_id: &str) -> Result<()> {
        let message = {
            let mut conn = self.pool.acquire().await?;
            messages::get_message_by_id(&mut conn, message_id).await?
        }
        .ok_or_else(|| {
            crate::error::Error::NotFound(format!("message {} disappeared mid-run", message_id))
        })?;

        let subject = message.subject.clone().unwrap_or_default();
        let body = message.body_text();

        // Classify; insert and latest-pointer update are one transaction
        let outcome = classifier::classify_message(&self.llm, &subject, &body).await?;
        classifications::create_classification(
            &self.pool,
            &message.id,
            &outcome.labels,
            outcome.priority,
            &outcome.summary,
            Some(&self.llm.model_identifier()),
        )
        .await?;

        // Embed: one vector for short mail, a chunk set for long mail
        let embedding = self
            .embedder
            .embed_email(&subject, &body, message.from_addr.as_deref())
            .await?;
        match embedding {
            EmailEmbedding::Single(vector) => {
                messages::save_embedding(&self.pool, &message.id, &vector, self.embedder.model_name())
                    .await?;
            }
            EmailEmbedding::Chunked(chunks) => {
                messages::save_chunks(&self.pool, &message.id, self.embedder.model_name(), &chunks)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut progress = SyncProgress::new("pull");
        assert_eq!(progress.progress_percent(), 0.0);

        progress.total = 3;
        progress.processed = 1;
        assert_eq!(progress.progress_percent(), 33.3);

        progress.processed = 3;
        assert_eq!(progress.progress_percent(), 100.0);
    }

    #[test]
    fn test_new_progress_is_idle() {
        let progress = SyncProgress::new("classify");
        assert_eq!(progress.status, SyncStatus::Idle);
        assert!(progress.started_at.is_none());
        assert_eq!(progress.errors, 0);
    }
}
