use crate::{
    DbConn,
    error::{Error, Result},
};

/// Metadata key for the mail provider's incremental-sync cursor.
const HISTORY_ID_KEY: &str = "historyId";

pub async fn get_history_id(conn: &mut DbConn) -> Result<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = $1")
        .bind(HISTORY_ID_KEY)
        .fetch_optional(conn)
        .await
        .map_err(Error::Sqlx)
}

pub async fn set_history_id(conn: &mut DbConn, history_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO metadata (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(HISTORY_ID_KEY)
    .bind(history_id)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}
