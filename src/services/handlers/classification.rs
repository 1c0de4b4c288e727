//! Label-based queries over the classification whitelist.

use super::{HandlerContext, clean_extraction_reply, format_chat_history, format_sources};
use crate::models::chat::{ChatTurn, Confidence, QueryKind, QueryResponse};
use crate::models::classification::{label_from_query, map_term_to_label};
use crate::queries::messages;
use crate::services::context;
use tracing::{debug, info};

pub async fn handle(
    ctx: &HandlerContext,
    question: &str,
    limit: i64,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling classification query");

    let mut matched_label = label_from_query(question).map(str::to_string);

    // Follow-ups ("how many of those?") name no label; mine the history
    if matched_label.is_none() && !chat_history.is_empty() {
        matched_label = extract_label_from_history(ctx, chat_history).await;
        info!(label = ?matched_label, "label extracted from history");
    }

    let Some(label) = matched_label else {
        return QueryResponse::empty(
            "I couldn't determine which classification label you're asking about.",
            question,
            QueryKind::Classification,
        );
    };

    let (emails, total_count) = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::Classification,
                );
            }
        };
        match messages::list_messages_by_label(&mut conn, &label, limit, 0).await {
            Ok(result) => result,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::Classification,
                );
            }
        }
    };

    if emails.is_empty() {
        return QueryResponse::empty(
            format!(
                "I couldn't find any emails with the label '{}' in the database.",
                label
            ),
            question,
            QueryKind::Classification,
        );
    }

    // The LLM sees a bounded sample; the answer reflects the full population
    let email_context = context::build_context_from_messages(&emails);
    let prompt = format!(
        "You are an email assistant with direct access to the user's email database.\n\n\
         The user has asked about emails with the classification label: \"{label}\"\n\n\
         TOTAL EMAILS WITH THIS LABEL: {total_count}\n\n\
         I am providing you with {sample_count} sample emails (limited for context) from \
         this category.\n\n\
         ===== SAMPLE EMAILS WITH LABEL \"{label}\" =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n\n\
         Based on the classification data, there are {total_count} emails labeled as \
         \"{label}\". Here is the detailed answer:",
        sample_count = emails.len(),
    );

    let answer = ctx
        .llm
        .generate(&prompt)
        .await
        .unwrap_or_else(|e| format!("Failed to generate answer: {}", e));

    let mut response = QueryResponse::new(
        answer,
        format_sources(&emails, 1.0),
        question,
        Confidence::High,
        QueryKind::Classification,
    );
    response.total_count = Some(total_count);
    response
}

/// Asks the LLM which classification topic the conversation was about. The
/// raw reply is lowercased and trimmed, then mapped through the query-term
/// table; unmapped replies count only when already whitelisted.
async fn extract_label_from_history(
    ctx: &HandlerContext,
    chat_history: &[ChatTurn],
) -> Option<String> {
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "What email classification topic was this conversation about? Answer with a single \
         word or short phrase (e.g. \"finance\", \"job rejection\", \"promotions\"). Answer \
         \"none\" if no topic was discussed.{history_context}",
    );

    let reply = match ctx
        .llm
        .classify(
            "You are a precise extraction assistant. Return only the requested information \
             with no explanations or preambles.",
            &prompt,
        )
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            debug!("history label extraction failed: {}", e);
            return None;
        }
    };

    let extracted = clean_extraction_reply(&reply, &[]).to_lowercase();
    if extracted == "none" || extracted.len() < 2 {
        return None;
    }

    map_term_to_label(&extracted)
}
