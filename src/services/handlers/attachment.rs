//! Search for emails carrying attachments.

use super::{HandlerContext, format_sources};
use crate::models::chat::{Confidence, QueryKind, QueryResponse};
use crate::queries::messages;
use crate::services::context;
use tracing::info;

pub async fn handle(ctx: &HandlerContext, question: &str, limit: i64) -> QueryResponse {
    info!("Handling attachment search");

    let emails = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => return QueryResponse::empty(
                format!("Failed to search emails due to database error: {}", e),
                question,
                QueryKind::SearchByAttachment,
            ),
        };
        match messages::search_by_attachment(&mut conn, limit).await {
            Ok(emails) => emails,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::SearchByAttachment,
                );
            }
        }
    };

    if emails.is_empty() {
        return QueryResponse::empty(
            "I couldn't find any emails with attachments.",
            question,
            QueryKind::SearchByAttachment,
        );
    }

    let email_context = context::build_context_from_messages(&emails);
    let prompt = format!(
        "You are an email assistant with direct access to the user's email database.\n\n\
         The emails below all have attachments. Analyze them to answer the question.\n\n\
         ===== EMAILS WITH ATTACHMENTS =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n",
    );

    let answer = ctx
        .llm
        .generate(&prompt)
        .await
        .unwrap_or_else(|e| format!("Failed to generate answer: {}", e));

    QueryResponse::new(
        answer,
        format_sources(&emails, 1.0),
        question,
        Confidence::High,
        QueryKind::SearchByAttachment,
    )
}
