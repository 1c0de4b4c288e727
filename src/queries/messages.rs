use crate::{
    DbConn, DbPool,
    error::{Error, Result},
    models::message::MailMessage,
};
use chrono::{NaiveDate, Utc};
use pgvector::Vector;
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Row};
use uuid::Uuid;

/// Column list shared by every query that returns messages joined with their
/// latest classification.
const MESSAGE_COLUMNS: &str = "m.id, m.thread_id, m.from_addr, m.to_addr, m.subject, m.snippet, \
     m.labels, m.internal_date, m.payload, m.raw, m.headers, m.has_attachments, \
     c.labels AS class_labels, c.priority AS class_priority, c.summary AS class_summary";

/// Raw row shape for message queries. JSONB columns are decoded manually so
/// NULLs stay cheap.
#[derive(Debug, FromRow)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub labels: Option<Value>,
    pub internal_date: Option<i64>,
    pub payload: Option<Value>,
    pub raw: Option<String>,
    pub headers: Option<Value>,
    pub has_attachments: bool,
    pub class_labels: Option<Value>,
    pub class_priority: Option<String>,
    pub class_summary: Option<String>,
}

/// Message row carrying a retrieval score (vector similarity or FTS rank).
#[derive(Debug, FromRow)]
pub struct ScoredMessageRow {
    #[sqlx(flatten)]
    pub message: MessageRow,
    pub score: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct EmailChunkRow {
    pub id: Uuid,
    pub message_id: String,
    pub chunk_index: i32,
    pub chunk_text: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SenderCount {
    pub from_addr: String,
    pub count: i64,
}

fn json_to_string_list(value: Option<Value>) -> Option<Vec<String>> {
    value.and_then(|v| match v {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    })
}

impl MessageRow {
    pub fn into_mail_message(self) -> MailMessage {
        let headers = self
            .headers
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        MailMessage {
            id: self.id,
            thread_id: self.thread_id,
            from_addr: self.from_addr,
            to_addr: self.to_addr,
            subject: self.subject,
            snippet: self.snippet,
            labels: json_to_string_list(self.labels),
            internal_date: self.internal_date,
            payload: self.payload,
            raw: self.raw,
            headers,
            has_attachments: self.has_attachments,
            classification_labels: json_to_string_list(self.class_labels),
            priority: self.class_priority,
            summary: self.class_summary,
        }
    }
}

fn rows_to_messages(rows: Vec<MessageRow>) -> Vec<MailMessage> {
    rows.into_iter().map(MessageRow::into_mail_message).collect()
}

fn rows_to_scored(rows: Vec<ScoredMessageRow>) -> Vec<(MailMessage, f64)> {
    rows.into_iter()
        .map(|r| (r.message.into_mail_message(), r.score))
        .collect()
}

fn labels_json(msg: &MailMessage) -> Option<Value> {
    msg.labels.as_ref().map(|l| serde_json::json!(l))
}

fn headers_json(msg: &MailMessage) -> Value {
    serde_json::to_value(&msg.headers).unwrap_or(Value::Null)
}

/// Upserts a message by provider id; payload fields are last-write-wins.
pub async fn save_message(conn: &mut DbConn, msg: &MailMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages
        (id, thread_id, from_addr, to_addr, subject, snippet, labels,
         internal_date, payload, raw, headers, fetched_at, has_attachments)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            thread_id = EXCLUDED.thread_id,
            from_addr = EXCLUDED.from_addr,
            to_addr = EXCLUDED.to_addr,
            subject = EXCLUDED.subject,
            snippet = EXCLUDED.snippet,
            labels = EXCLUDED.labels,
            internal_date = EXCLUDED.internal_date,
            payload = EXCLUDED.payload,
            raw = EXCLUDED.raw,
            headers = EXCLUDED.headers,
            fetched_at = EXCLUDED.fetched_at,
            has_attachments = EXCLUDED.has_attachments
        "#,
    )
    .bind(&msg.id)
    .bind(&msg.thread_id)
    .bind(&msg.from_addr)
    .bind(&msg.to_addr)
    .bind(&msg.subject)
    .bind(&msg.snippet)
    .bind(labels_json(msg))
    .bind(msg.internal_date)
    .bind(&msg.payload)
    .bind(&msg.raw)
    .bind(headers_json(msg))
    .bind(Utc::now())
    .bind(msg.has_attachments)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Upserts a batch of messages in one transaction, paged to keep bind counts
/// bounded. All-or-nothing.
pub async fn save_messages_batch(pool: &DbPool, msgs: &[MailMessage]) -> Result<()> {
    const PAGE_SIZE: usize = 100;

    if msgs.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let mut tx = pool.begin().await.map_err(Error::Sqlx)?;

    for page in msgs.chunks(PAGE_SIZE) {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO messages \
             (id, thread_id, from_addr, to_addr, subject, snippet, labels, \
              internal_date, payload, raw, headers, fetched_at, has_attachments) ",
        );
        qb.push_values(page, |mut b, msg| {
            b.push_bind(msg.id.clone())
                .push_bind(msg.thread_id.clone())
                .push_bind(msg.from_addr.clone())
                .push_bind(msg.to_addr.clone())
                .push_bind(msg.subject.clone())
                .push_bind(msg.snippet.clone())
                .push_bind(labels_json(msg))
                .push_bind(msg.internal_date)
                .push_bind(msg.payload.clone())
                .push_bind(msg.raw.clone())
                .push_bind(headers_json(msg))
                .push_bind(now)
                .push_bind(msg.has_attachments);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             thread_id = EXCLUDED.thread_id, \
             from_addr = EXCLUDED.from_addr, \
             to_addr = EXCLUDED.to_addr, \
             subject = EXCLUDED.subject, \
             snippet = EXCLUDED.snippet, \
             labels = EXCLUDED.labels, \
             internal_date = EXCLUDED.internal_date, \
             payload = EXCLUDED.payload, \
             raw = EXCLUDED.raw, \
             headers = EXCLUDED.headers, \
             fetched_at = EXCLUDED.fetched_at, \
             has_attachments = EXCLUDED.has_attachments",
        );
        qb.build().execute(tx.as_mut()).await.map_err(Error::Sqlx)?;
    }

    tx.commit().await.map_err(Error::Sqlx)?;
    Ok(())
}

/// Gets a single message joined with its latest classification.
pub async fn get_message_by_id(conn: &mut DbConn, message_id: &str) -> Result<Option<MailMessage>> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} \
         FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         WHERE m.id = $1"
    ))
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.map(MessageRow::into_mail_message))
}

/// Lists messages ordered by internal date descending.
pub async fn list_messages(conn: &mut DbConn, limit: i64, offset: i64) -> Result<Vec<MailMessage>> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} \
         FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         ORDER BY m.internal_date DESC NULLS LAST \
         LIMIT $1 OFFSET $2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows_to_messages(rows))
}

pub async fn get_message_ids(conn: &mut DbConn) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>("SELECT id FROM messages")
        .fetch_all(conn)
        .await
        .map_err(Error::Sqlx)
}

pub async fn get_unclassified_message_ids(conn: &mut DbConn) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT id FROM messages WHERE latest_classification_id IS NULL",
    )
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

pub async fn count_classified_messages(conn: &mut DbConn) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages WHERE latest_classification_id IS NOT NULL",
    )
    .fetch_one(conn)
    .await
    .map_err(Error::Sqlx)
}

/// Ids of messages with neither a row-level embedding nor any chunks.
pub async fn get_unembedded_message_ids(conn: &mut DbConn) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT m.id \
         FROM messages m \
         LEFT JOIN email_chunks ec ON m.id = ec.message_id \
         WHERE m.embedding IS NULL AND ec.message_id IS NULL",
    )
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

/// Filter parameters for [`list_messages_by_filters`]. Label filtering uses
/// AND semantics; priority matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct MessageFilters {
    pub priority: Option<String>,
    pub labels: Option<Vec<String>>,
    pub classified: Option<bool>,
}

fn push_separator(qb: &mut QueryBuilder<'_, sqlx::Postgres>, first: &mut bool) {
    if *first {
        qb.push(" WHERE ");
        *first = false;
    } else {
        qb.push(" AND ");
    }
}

fn push_filter_clauses(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filters: &MessageFilters) {
    let mut first = true;

    match filters.classified {
        Some(true) => {
            push_separator(qb, &mut first);
            qb.push("m.latest_classification_id IS NOT NULL");
        }
        Some(false) => {
            push_separator(qb, &mut first);
            qb.push("m.latest_classification_id IS NULL");
        }
        None => {}
    }

    if let Some(priority) = &filters.priority {
        push_separator(qb, &mut first);
        qb.push("LOWER(c.priority) = LOWER(");
        qb.push_bind(priority.clone());
        qb.push(")");
    }

    if let Some(labels) = &filters.labels {
        for label in labels {
            push_separator(qb, &mut first);
            qb.push("c.labels @> ");
            qb.push_bind(serde_json::json!([label]));
            qb.push("::jsonb");
        }
    }
}

/// Lists messages under combined filters, returning `(messages, total_count)`.
pub async fn list_messages_by_filters(
    conn: &mut DbConn,
    filters: &MessageFilters,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MailMessage>, i64)> {
    // Unclassified (or unfiltered) listings must keep messages without a
    // classification, so the join tightens only when a classification
    // predicate is in play.
    let needs_classification = filters.priority.is_some()
        || filters.labels.as_ref().is_some_and(|l| !l.is_empty())
        || filters.classified == Some(true);
    let join = if needs_classification {
        "INNER JOIN"
    } else {
        "LEFT JOIN"
    };

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m \
         {join} classifications c ON m.latest_classification_id = c.id"
    ));
    push_filter_clauses(&mut qb, filters);
    qb.push(" ORDER BY m.internal_date DESC NULLS LAST LIMIT ");
    qb.push_bind(limit);
    qb.push(" OFFSET ");
    qb.push_bind(offset);

    let rows: Vec<MessageRow> = qb
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Sqlx)?;

    let mut count_qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
        "SELECT COUNT(*) FROM messages m \
         {join} classifications c ON m.latest_classification_id = c.id"
    ));
    push_filter_clauses(&mut count_qb, filters);

    let total: i64 = count_qb
        .build()
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Sqlx)?
        .get(0);

    Ok((rows_to_messages(rows), total))
}

pub async fn list_messages_by_label(
    conn: &mut DbConn,
    label: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MailMessage>, i64)> {
    let filters = MessageFilters {
        labels: Some(vec![label.to_string()]),
        ..Default::default()
    };
    list_messages_by_filters(conn, &filters, limit, offset).await
}

pub async fn list_messages_by_priority(
    conn: &mut DbConn,
    priority: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MailMessage>, i64)> {
    let filters = MessageFilters {
        priority: Some(priority.to_string()),
        ..Default::default()
    };
    list_messages_by_filters(conn, &filters, limit, offset).await
}

pub async fn list_classified_messages(
    conn: &mut DbConn,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MailMessage>, i64)> {
    let filters = MessageFilters {
        classified: Some(true),
        ..Default::default()
    };
    list_messages_by_filters(conn, &filters, limit, offset).await
}

pub async fn list_unclassified_messages(
    conn: &mut DbConn,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MailMessage>, i64)> {
    let filters = MessageFilters {
        classified: Some(false),
        ..Default::default()
    };
    list_messages_by_filters(conn, &filters, limit, offset).await
}

/// Case-insensitive substring match on the sender, newest first.
pub async fn search_by_sender(
    conn: &mut DbConn,
    sender: &str,
    limit: i64,
) -> Result<Vec<MailMessage>> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} \
         FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         WHERE m.from_addr ILIKE $1 \
         ORDER BY m.internal_date DESC NULLS LAST \
         LIMIT $2"
    ))
    .bind(format!("%{}%", sender))
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows_to_messages(rows))
}

/// Messages with attachments, newest first.
pub async fn search_by_attachment(conn: &mut DbConn, limit: i64) -> Result<Vec<MailMessage>> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} \
         FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         WHERE m.has_attachments = TRUE \
         ORDER BY m.internal_date DESC NULLS LAST \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows_to_messages(rows))
}

/// OR-semantics substring match on subject/sender/snippet, newest first.
pub async fn search_by_keywords(
    conn: &mut DbConn,
    keywords: &[String],
    limit: i64,
) -> Result<Vec<MailMessage>> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         WHERE "
    ));
    for (i, keyword) in keywords.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        let pattern = format!("%{}%", keyword);
        qb.push("(m.subject ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR m.from_addr ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR m.snippet ILIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
    qb.push(" ORDER BY m.internal_date DESC NULLS LAST LIMIT ");
    qb.push_bind(limit);

    let rows: Vec<MessageRow> = qb
        .build_query_as()
        .fetch_all(conn)
        .await
        .map_err(Error::Sqlx)?;

    Ok(rows_to_messages(rows))
}

pub async fn count_by_topic(conn: &mut DbConn, topic: &str) -> Result<i64> {
    let pattern = format!("%{}%", topic);
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages \
         WHERE subject ILIKE $1 OR from_addr ILIKE $1 OR snippet ILIKE $1",
    )
    .bind(pattern)
    .fetch_one(conn)
    .await
    .map_err(Error::Sqlx)
}

pub async fn get_daily_email_stats(conn: &mut DbConn, days: i64) -> Result<Vec<DailyCount>> {
    sqlx::query_as::<_, DailyCount>(
        "SELECT DATE(to_timestamp(internal_date / 1000)) AS date, COUNT(*) AS count \
         FROM messages \
         WHERE internal_date IS NOT NULL \
         GROUP BY date \
         ORDER BY date DESC \
         LIMIT $1",
    )
    .bind(days)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

pub async fn get_top_senders(conn: &mut DbConn, limit: i64) -> Result<Vec<SenderCount>> {
    sqlx::query_as::<_, SenderCount>(
        "SELECT from_addr, COUNT(*) AS count \
         FROM messages \
         WHERE from_addr IS NOT NULL \
         GROUP BY from_addr \
         ORDER BY count DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

pub async fn get_total_message_count(conn: &mut DbConn) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
        .fetch_one(conn)
        .await
        .map_err(Error::Sqlx)
}

/// Counts messages carrying the provider's UNREAD label.
pub async fn get_unread_count(conn: &mut DbConn) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE labels::text LIKE '%UNREAD%'")
        .fetch_one(conn)
        .await
        .map_err(Error::Sqlx)
}

/// Per-label message counts over latest classifications.
pub async fn get_label_counts(conn: &mut DbConn) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT label, COUNT(*) AS count FROM ( \
             SELECT jsonb_array_elements_text(c.labels) AS label \
             FROM messages m \
             JOIN classifications c ON m.latest_classification_id = c.id \
         ) labels \
         GROUP BY label \
         ORDER BY count DESC",
    )
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
        .collect())
}

/// Weighted full-text search with document-length-normalized ranking.
/// Multiple terms combine with boolean AND (plainto_tsquery semantics).
pub async fn keyword_search(
    conn: &mut DbConn,
    query: &str,
    limit: i64,
    threshold: f64,
) -> Result<Vec<(MailMessage, f64)>> {
    let rows = sqlx::query_as::<_, ScoredMessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS}, ts_rank_cd(m.search_vector, query, 1)::float8 AS score \
         FROM messages m \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id, \
              plainto_tsquery('english', $1) query \
         WHERE m.search_vector @@ query \
           AND ts_rank_cd(m.search_vector, query, 1) >= $2 \
         ORDER BY score DESC \
         LIMIT $3"
    ))
    .bind(query)
    .bind(threshold)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows_to_scored(rows))
}

/// Cosine-similarity search over both embedding sources: messages with a
/// single row-level vector, and chunked messages scored by their best chunk.
/// Each message appears at most once with its best score, sorted descending.
pub async fn similarity_search(
    conn: &mut DbConn,
    query_embedding: &[f32],
    limit: i64,
    threshold: f64,
) -> Result<Vec<(MailMessage, f64)>> {
    let rows = sqlx::query_as::<_, ScoredMessageRow>(&format!(
        "WITH email_scores AS ( \
             SELECT m.id, 1 - (m.embedding <=> $1) AS similarity \
             FROM messages m \
             WHERE m.embedding IS NOT NULL \
               AND (1 - (m.embedding <=> $1)) >= $2 \
             UNION ALL \
             SELECT ec.message_id AS id, MAX(1 - (ec.embedding <=> $1)) AS similarity \
             FROM email_chunks ec \
             WHERE (1 - (ec.embedding <=> $1)) >= $2 \
             GROUP BY ec.message_id \
         ), best AS ( \
             SELECT DISTINCT ON (id) id, similarity \
             FROM email_scores \
             ORDER BY id, similarity DESC \
         ) \
         SELECT {MESSAGE_COLUMNS}, best.similarity AS score \
         FROM best \
         JOIN messages m ON m.id = best.id \
         LEFT JOIN classifications c ON m.latest_classification_id = c.id \
         ORDER BY best.similarity DESC \
         LIMIT $3"
    ))
    .bind(Vector::from(query_embedding.to_vec()))
    .bind(threshold)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows_to_scored(rows))
}

/// Writes a single-vector embedding, clearing any chunk set so exactly one
/// embedding representation exists per message.
pub async fn save_embedding(
    pool: &DbPool,
    message_id: &str,
    embedding: &[f32],
    model: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(Error::Sqlx)?;

    sqlx::query("DELETE FROM email_chunks WHERE message_id = $1")
        .bind(message_id)
        .execute(tx.as_mut())
        .await
        .map_err(Error::Sqlx)?;

    let updated = sqlx::query(
        "UPDATE messages \
         SET embedding = $2, embedding_model = $3, embedded_at = NOW() \
         WHERE id = $1",
    )
    .bind(message_id)
    .bind(Vector::from(embedding.to_vec()))
    .bind(model)
    .execute(tx.as_mut())
    .await
    .map_err(Error::Sqlx)?;

    if updated.rows_affected() == 0 {
        return Err(Error::NotFound(format!("message {} not found", message_id)));
    }

    tx.commit().await.map_err(Error::Sqlx)?;
    Ok(())
}

/// Replaces a message's chunk set in one transaction, clearing any row-level
/// embedding. Chunk indexes are assigned 0..n in input order.
pub async fn save_chunks(
    pool: &DbPool,
    message_id: &str,
    model: &str,
    chunks: &[(String, Vec<f32>)],
) -> Result<()> {
    if chunks.is_empty() {
        return Err(Error::InvalidInput(
            "chunk set must be non-empty".to_string(),
        ));
    }

    let mut tx = pool.begin().await.map_err(Error::Sqlx)?;

    let updated = sqlx::query(
        "UPDATE messages \
         SET embedding = NULL, embedding_model = $2, embedded_at = NOW() \
         WHERE id = $1",
    )
    .bind(message_id)
    .bind(model)
    .execute(tx.as_mut())
    .await
    .map_err(Error::Sqlx)?;

    if updated.rows_affected() == 0 {
        return Err(Error::NotFound(format!("message {} not found", message_id)));
    }

    sqlx::query("DELETE FROM email_chunks WHERE message_id = $1")
        .bind(message_id)
        .execute(tx.as_mut())
        .await
        .map_err(Error::Sqlx)?;

    for (index, (text, embedding)) in chunks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO email_chunks (id, message_id, chunk_index, chunk_text, embedding) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::now_v7())
        .bind(message_id)
        .bind(index as i32)
        .bind(text)
        .bind(Vector::from(embedding.clone()))
        .execute(tx.as_mut())
        .await
        .map_err(Error::Sqlx)?;
    }

    tx.commit().await.map_err(Error::Sqlx)?;
    Ok(())
}

/// Reads back a message's stored embedding, if it has a row-level one.
pub async fn get_message_embedding(
    conn: &mut DbConn,
    message_id: &str,
) -> Result<Option<Vec<f32>>> {
    let row: Option<Vector> = sqlx::query_scalar(
        "SELECT embedding FROM messages WHERE id = $1 AND embedding IS NOT NULL",
    )
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.map(|v| v.to_vec()))
}

pub async fn get_chunks_for_message(
    conn: &mut DbConn,
    message_id: &str,
) -> Result<Vec<EmailChunkRow>> {
    sqlx::query_as::<_, EmailChunkRow>(
        "SELECT id, message_id, chunk_index, chunk_text \
         FROM email_chunks \
         WHERE message_id = $1 \
         ORDER BY chunk_index",
    )
    .bind(message_id)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}
