//! The question-answering entry point: classify the query, dispatch to the
//! matching handler, thread chat history through, and persist the exchange.

use crate::DbPool;
use crate::error::Result;
use crate::models::chat::{ChatRole, ChatTurn, QueryKind, QueryResponse};
use crate::queries::{chat, messages};
use crate::services::embedding::Embedder;
use crate::services::handlers::{
    HandlerContext, aggregation, attachment, classification, conversation, semantic, sender,
    temporal,
};
use crate::services::llm::LlmGateway;
use crate::services::query_classifier;
use crate::services::reranker::CrossEncoder;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SimilarEmail {
    pub message_id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub snippet: Option<String>,
    pub similarity: f64,
    pub date: Option<i64>,
    pub labels: Vec<String>,
}

pub struct RagEngine {
    ctx: HandlerContext,
    top_k: usize,
    similarity_threshold: f64,
}

impl RagEngine {
    pub fn new(
        pool: DbPool,
        llm: Arc<LlmGateway>,
        embedder: Arc<Embedder>,
        reranker: Arc<CrossEncoder>,
        top_k: usize,
        similarity_threshold: f64,
    ) -> Self {
        info!(
            provider = %llm.provider(),
            model = %llm.model(),
            top_k,
            "RAG engine initialized"
        );
        Self {
            ctx: HandlerContext {
                pool,
                llm,
                embedder,
                reranker,
            },
            top_k,
            similarity_threshold,
        }
    }

    /// Answers a question over the mailbox. With a chat session, the user
    /// message is recorded first (scheduling title generation when it is the
    /// session's first), and the assistant's reply is appended afterwards
    /// with its sources, confidence and query type.
    pub async fn query(
        &self,
        question: &str,
        chat_session_id: Option<Uuid>,
        top_k: Option<usize>,
        similarity_threshold: Option<f64>,
        chat_history: &[ChatTurn],
    ) -> Result<QueryResponse> {
        let limit = top_k.unwrap_or(self.top_k) as i64;
        let threshold = similarity_threshold.unwrap_or(self.similarity_threshold);

        info!("RAG query: '{}' (top_k={}, threshold={})", question, limit, threshold);

        if let Some(session_id) = chat_session_id {
            self.record_user_message(session_id, question).await?;
        }

        let query_type =
            query_classifier::detect_query_type(&self.ctx.llm, question, chat_history).await;
        info!(kind = %query_type, "dispatching query");

        let response = match query_type {
            QueryKind::Conversation => conversation::handle(&self.ctx, question).await,
            QueryKind::Aggregation => aggregation::handle(&self.ctx, question, chat_history).await,
            QueryKind::SearchBySender => {
                sender::handle(&self.ctx, question, limit, chat_history).await
            }
            QueryKind::SearchByAttachment => attachment::handle(&self.ctx, question, limit).await,
            QueryKind::Classification => {
                classification::handle(&self.ctx, question, limit, chat_history).await
            }
            QueryKind::FilteredTemporal => {
                temporal::handle_filtered(&self.ctx, question, limit, chat_history).await
            }
            QueryKind::Temporal => temporal::handle(&self.ctx, question, limit, chat_history).await,
            QueryKind::Semantic => {
                semantic::handle(&self.ctx, question, limit, threshold, chat_history).await
            }
        };

        if let Some(session_id) = chat_session_id {
            self.record_assistant_message(session_id, &response).await;
        }

        Ok(response)
    }

    /// Saves the user turn; on a session's first user message, spawns the
    /// background title-generation task. The request never awaits it.
    async fn record_user_message(&self, session_id: Uuid, question: &str) -> Result<()> {
        let mut conn = self.ctx.pool.acquire().await?;
        let is_first = chat::count_user_messages(&mut conn, session_id).await? == 0;
        chat::save_message_to_chat_session(
            &mut conn,
            session_id,
            ChatRole::User,
            question,
            None,
            None,
            None,
        )
        .await?;
        drop(conn);

        if is_first {
            let llm = Arc::clone(&self.ctx.llm);
            let pool = self.ctx.pool.clone();
            let question = question.to_string();
            tokio::spawn(async move {
                let title = llm.generate_chat_title(&question).await;
                let result = async {
                    let mut conn = pool.acquire().await?;
                    chat::update_chat_session_title(&mut conn, session_id, &title).await
                }
                .await;
                match result {
                    Ok(()) => info!("Chat session {} titled '{}'", session_id, title),
                    Err(e) => warn!("Failed to store chat title: {}", e),
                }
            });
        }

        Ok(())
    }

    /// Appends the assistant turn. Persistence failures are logged, not
    /// surfaced; the caller already has the answer.
    async fn record_assistant_message(&self, session_id: Uuid, response: &QueryResponse) {
        let sources = serde_json::to_value(&response.sources).ok();
        let result = async {
            let mut conn = self.ctx.pool.acquire().await?;
            chat::save_message_to_chat_session(
                &mut conn,
                session_id,
                ChatRole::Assistant,
                &response.answer,
                sources,
                Some(&response.confidence.to_string()),
                Some(&response.query_type.to_string()),
            )
            .await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to persist assistant message: {}", e);
        }
    }

    /// Finds emails similar to a stored message by its own embedding,
    /// excluding the message itself.
    pub async fn find_similar_emails(
        &self,
        message_id: &str,
        limit: usize,
    ) -> Result<Vec<SimilarEmail>> {
        let mut conn = self.ctx.pool.acquire().await?;

        if messages::get_message_by_id(&mut conn, message_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let Some(embedding) = messages::get_message_embedding(&mut conn, message_id).await? else {
            return Ok(Vec::new());
        };

        // One extra so the source message can be filtered out
        let similar =
            messages::similarity_search(&mut conn, &embedding, limit as i64 + 1, 0.5).await?;

        Ok(similar
            .into_iter()
            .filter(|(message, _)| message.id != message_id)
            .take(limit)
            .map(|(message, similarity)| SimilarEmail {
                message_id: message.id,
                subject: message.subject,
                from: message.from_addr,
                snippet: message.snippet,
                similarity,
                date: message.internal_date,
                labels: message.classification_labels.unwrap_or_default(),
            })
            .collect())
    }

    pub fn handler_context(&self) -> &HandlerContext {
        &self.ctx
    }
}
