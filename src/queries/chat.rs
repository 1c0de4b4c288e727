use crate::{
    DbConn,
    error::{Error, Result},
    models::chat::{ChatMessage, ChatRole, ChatSession, ChatSessionSummary},
};
use serde_json::Value;
use uuid::Uuid;

/// Creates a new chat session; untitled sessions start as "New Chat" until
/// the background title task renames them.
pub async fn create_chat_session(conn: &mut DbConn, title: Option<&str>) -> Result<ChatSession> {
    let session = sqlx::query_as::<_, ChatSession>(
        "INSERT INTO chat_sessions (id, title, created_at, updated_at) \
         VALUES ($1, $2, NOW(), NOW()) \
         RETURNING id, title, created_at, updated_at",
    )
    .bind(Uuid::now_v7())
    .bind(title.unwrap_or("New Chat"))
    .fetch_one(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(session)
}

pub async fn get_chat_session(conn: &mut DbConn, session_id: Uuid) -> Result<ChatSession> {
    sqlx::query_as::<_, ChatSession>(
        "SELECT id, title, created_at, updated_at FROM chat_sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?
    .ok_or_else(|| Error::NotFound(format!("chat session {} not found", session_id)))
}

/// Lists sessions with their message counts, most recently active first.
pub async fn list_chat_sessions(
    conn: &mut DbConn,
    limit: i64,
    offset: i64,
) -> Result<Vec<ChatSessionSummary>> {
    sqlx::query_as::<_, ChatSessionSummary>(
        "SELECT s.id, s.title, s.created_at, s.updated_at, COUNT(m.id) AS message_count \
         FROM chat_sessions s \
         LEFT JOIN chat_messages m ON s.id = m.chat_session_id \
         GROUP BY s.id, s.title, s.created_at, s.updated_at \
         ORDER BY s.updated_at DESC \
         LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

/// Messages of a session in timestamp order.
pub async fn get_chat_session_messages(
    conn: &mut DbConn,
    session_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<ChatMessage>> {
    sqlx::query_as::<_, ChatMessage>(
        "SELECT id, chat_session_id, role, content, sources, confidence, query_type, timestamp \
         FROM chat_messages \
         WHERE chat_session_id = $1 \
         ORDER BY timestamp ASC \
         LIMIT $2 OFFSET $3",
    )
    .bind(session_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)
}

/// Appends a message and refreshes the session's `updated_at`, atomically.
pub async fn save_message_to_chat_session(
    conn: &mut DbConn,
    session_id: Uuid,
    role: ChatRole,
    content: &str,
    sources: Option<Value>,
    confidence: Option<&str>,
    query_type: Option<&str>,
) -> Result<Uuid> {
    let message_id = Uuid::now_v7();

    sqlx::query(
        "INSERT INTO chat_messages \
         (id, chat_session_id, role, content, sources, confidence, query_type, timestamp) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())",
    )
    .bind(message_id)
    .bind(session_id)
    .bind(role.to_string())
    .bind(content)
    .bind(sources)
    .bind(confidence)
    .bind(query_type)
    .execute(&mut *conn)
    .await
    .map_err(Error::Sqlx)?;

    sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
        .bind(session_id)
        .execute(conn)
        .await
        .map_err(Error::Sqlx)?;

    Ok(message_id)
}

/// Deletes a session; its messages cascade.
pub async fn delete_chat_session(conn: &mut DbConn, session_id: Uuid) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
        .bind(session_id)
        .execute(conn)
        .await
        .map_err(Error::Sqlx)?;

    if deleted.rows_affected() == 0 {
        return Err(Error::NotFound(format!("chat session {} not found", session_id)));
    }
    Ok(())
}

pub async fn update_chat_session_title(
    conn: &mut DbConn,
    session_id: Uuid,
    title: &str,
) -> Result<()> {
    sqlx::query("UPDATE chat_sessions SET title = $2, updated_at = NOW() WHERE id = $1")
        .bind(session_id)
        .bind(title)
        .execute(conn)
        .await
        .map_err(Error::Sqlx)?;

    Ok(())
}

/// Count of user messages in a session; the title task runs only when the
/// incoming question is the first one.
pub async fn count_user_messages(conn: &mut DbConn, session_id: Uuid) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM chat_messages WHERE chat_session_id = $1 AND role = 'user'",
    )
    .bind(session_id)
    .fetch_one(conn)
    .await
    .map_err(Error::Sqlx)
}
