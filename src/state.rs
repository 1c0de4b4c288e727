use crate::DbPool;
use crate::services::rag::RagEngine;
use crate::services::sync::SyncController;
use std::sync::Arc;

/// Application state shared across the service's entry points: the database
/// pool, the query engine, and the sync controller.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub rag: Arc<RagEngine>,
    pub sync: Arc<SyncController>,
}

impl AppState {
    pub fn new(pool: DbPool, rag: Arc<RagEngine>, sync: Arc<SyncController>) -> Self {
        Self { pool, rag, sync }
    }
}
