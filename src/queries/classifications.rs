use crate::{
    DbConn, DbPool,
    error::{Error, Result},
    models::classification::{Classification, Priority},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct ClassificationRow {
    id: Uuid,
    message_id: String,
    labels: Option<Value>,
    priority: Option<String>,
    summary: Option<String>,
    model: Option<String>,
    created_at: DateTime<Utc>,
}

impl ClassificationRow {
    fn into_classification(self) -> Classification {
        let labels = self
            .labels
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Classification {
            id: self.id,
            message_id: self.message_id,
            labels,
            // Legacy values fold to the authoritative set on read
            priority: self.priority.map(|p| Priority::parse(&p).to_string()),
            summary: self.summary,
            model: self.model,
            created_at: self.created_at,
        }
    }
}

/// Inserts a classification and advances the owning message's latest pointer
/// in a single transaction. Returns the new classification id.
pub async fn create_classification(
    pool: &DbPool,
    message_id: &str,
    labels: &[String],
    priority: Priority,
    summary: &str,
    model: Option<&str>,
) -> Result<Uuid> {
    let mut tx = pool.begin().await.map_err(Error::Sqlx)?;

    let classification_id = Uuid::now_v7();

    sqlx::query(
        "INSERT INTO classifications (id, message_id, labels, priority, summary, model, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(classification_id)
    .bind(message_id)
    .bind(serde_json::json!(labels))
    .bind(priority.to_string())
    .bind(summary)
    .bind(model)
    .bind(Utc::now())
    .execute(tx.as_mut())
    .await
    .map_err(Error::Sqlx)?;

    let updated = sqlx::query("UPDATE messages SET latest_classification_id = $1 WHERE id = $2")
        .bind(classification_id)
        .bind(message_id)
        .execute(tx.as_mut())
        .await
        .map_err(Error::Sqlx)?;

    if updated.rows_affected() == 0 {
        return Err(Error::NotFound(format!("message {} not found", message_id)));
    }

    tx.commit().await.map_err(Error::Sqlx)?;
    Ok(classification_id)
}

/// Batch variant of [`create_classification`]; both the inserts and the
/// latest-pointer updates commit atomically.
pub async fn create_classifications_batch(
    pool: &DbPool,
    items: &[(String, Vec<String>, Priority, String, Option<String>)],
) -> Result<Vec<Uuid>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let created_at = Utc::now();
    let mut tx = pool.begin().await.map_err(Error::Sqlx)?;
    let mut ids = Vec::with_capacity(items.len());

    for (message_id, labels, priority, summary, model) in items {
        let classification_id = Uuid::now_v7();
        ids.push(classification_id);

        sqlx::query(
            "INSERT INTO classifications (id, message_id, labels, priority, summary, model, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(classification_id)
        .bind(message_id)
        .bind(serde_json::json!(labels))
        .bind(priority.to_string())
        .bind(summary)
        .bind(model)
        .bind(created_at)
        .execute(tx.as_mut())
        .await
        .map_err(Error::Sqlx)?;

        sqlx::query("UPDATE messages SET latest_classification_id = $1 WHERE id = $2")
            .bind(classification_id)
            .bind(message_id)
            .execute(tx.as_mut())
            .await
            .map_err(Error::Sqlx)?;
    }

    tx.commit().await.map_err(Error::Sqlx)?;
    Ok(ids)
}

/// Classification history for a message, newest first.
pub async fn list_for_message(
    conn: &mut DbConn,
    message_id: &str,
) -> Result<Vec<Classification>> {
    let rows = sqlx::query_as::<_, ClassificationRow>(
        "SELECT id, message_id, labels, priority, summary, model, created_at \
         FROM classifications \
         WHERE message_id = $1 \
         ORDER BY created_at DESC",
    )
    .bind(message_id)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows
        .into_iter()
        .map(ClassificationRow::into_classification)
        .collect())
}

/// The classification the message's latest pointer designates.
pub async fn get_latest(conn: &mut DbConn, message_id: &str) -> Result<Option<Classification>> {
    let row = sqlx::query_as::<_, ClassificationRow>(
        "SELECT c.id, c.message_id, c.labels, c.priority, c.summary, c.model, c.created_at \
         FROM classifications c \
         INNER JOIN messages m ON m.latest_classification_id = c.id \
         WHERE m.id = $1",
    )
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.map(ClassificationRow::into_classification))
}
