use mailmind::services::embedding::{Embedder, HttpEncoder};
use mailmind::services::llm::LlmGateway;
use mailmind::services::mail::GmailClient;
use mailmind::services::rag::RagEngine;
use mailmind::services::reranker::CrossEncoder;
use mailmind::services::sync::SyncController;
use mailmind::{AppState, init_db, init_tracing, load_config};
use std::sync::Arc;
use tracing::info;

/// Headless sync daemon: pull the mailbox, classify and embed new messages,
/// then idle until shutdown. The query engine is constructed alongside so a
/// serving layer can reuse the same state.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    let pool = init_db(&config).await?;
    info!("Database connected and migrated");

    let llm = Arc::new(LlmGateway::new(config.llm.clone()).await?);
    let embedder = Arc::new(Embedder::new(Arc::new(HttpEncoder::new(&config.embedding))));
    let reranker = Arc::new(CrossEncoder::new(&config.embedding.rerank_url));
    let mail = Arc::new(GmailClient::new(config.mail.clone()));

    let rag = Arc::new(RagEngine::new(
        pool.clone(),
        Arc::clone(&llm),
        Arc::clone(&embedder),
        Arc::clone(&reranker),
        config.rag.top_k,
        config.rag.similarity_threshold,
    ));

    let sync = Arc::new(SyncController::new(
        pool.clone(),
        mail,
        llm,
        embedder,
        config.mail.has_credentials(),
    ));

    let _state = AppState::new(pool, rag, Arc::clone(&sync));

    sync.start_pull().await;
    sync.start_classify().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let status = sync.sync_status().await?;
    info!(
        "Final state: {} messages, {} unclassified, {} unembedded",
        status.db_total, status.unclassified, status.unembedded
    );

    Ok(())
}
