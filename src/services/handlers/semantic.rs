//! Content questions answered through hybrid retrieval and reranking. The
//! retrieval core of the engine.

use super::{HandlerContext, format_chat_history, format_scored_sources};
use crate::models::chat::{ChatTurn, Confidence, QueryKind, QueryResponse};
use crate::queries::messages;
use crate::services::{context, search};
use tracing::{debug, info};

/// Candidate pool for the initial retrieval pass.
const RETRIEVAL_K: i64 = 50;
/// Pool and threshold overrides for counting-style questions, which need
/// recall over precision.
const COUNTING_RETRIEVAL_K: i64 = 100;
const COUNTING_THRESHOLD: f64 = 0.25;

const VECTOR_WEIGHT: f64 = 0.6;
const KEYWORD_WEIGHT: f64 = 0.4;

pub async fn handle(
    ctx: &HandlerContext,
    question: &str,
    limit: i64,
    threshold: f64,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling semantic query");

    let question_lower = question.to_lowercase();
    let is_counting_query = ["how many", "count", "number of"]
        .iter()
        .any(|w| question_lower.contains(w));

    let (retrieval_k, threshold) = if is_counting_query {
        debug!("counting query detected, widening retrieval");
        (COUNTING_RETRIEVAL_K, threshold.min(COUNTING_THRESHOLD))
    } else {
        (RETRIEVAL_K, threshold)
    };

    // Step 1: embed the question
    let question_embedding = match ctx.embedder.embed_text(question).await {
        Ok(embedding) => embedding,
        Err(e) => {
            return QueryResponse::empty(
                format!("Failed to process your question due to embedding error: {}", e),
                question,
                QueryKind::Semantic,
            );
        }
    };

    // Step 2: hybrid retrieval, falling back to pure vector search plus
    // cross-encoder reranking when full-text search is unavailable
    let similar_emails = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::Semantic,
                );
            }
        };

        let hybrid = search::hybrid_search(
            &mut conn,
            &question_embedding,
            question,
            limit,
            retrieval_k,
            VECTOR_WEIGHT,
            KEYWORD_WEIGHT,
        )
        .await;

        match hybrid {
            Ok(results) => results,
            Err(e) => {
                debug!("hybrid search unavailable ({}), using vector search + rerank", e);
                let vector_results = match messages::similarity_search(
                    &mut conn,
                    &question_embedding,
                    retrieval_k,
                    threshold,
                )
                .await
                {
                    Ok(results) => results,
                    Err(e) => {
                        return QueryResponse::empty(
                            format!("Failed to search emails due to database error: {}", e),
                            question,
                            QueryKind::Semantic,
                        );
                    }
                };
                ctx.reranker
                    .rerank(question, vector_results, limit.max(0) as usize)
                    .await
            }
        }
    };

    if similar_emails.is_empty() {
        debug!("no similar emails found");
        return QueryResponse::empty(
            "I couldn't find any relevant emails to answer your question.",
            question,
            QueryKind::Semantic,
        );
    }

    for (i, (email, score)) in similar_emails.iter().take(5).enumerate() {
        debug!(
            "  {}. score {:.3} subject '{}'",
            i + 1,
            score,
            email.subject.as_deref().unwrap_or("")
        );
    }

    // Step 3: context, step 4: answer
    let email_context = context::build_context(&similar_emails);
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "You are an email assistant. I have retrieved emails from the user's mailbox and \
         YOU MUST analyze them.\n\n\
         CRITICAL: The emails below are REAL emails from the user's database. You have been \
         given these emails TO ANALYZE - this is your job. Do NOT refuse or say you cannot \
         access them.\n\n\
         YOUR TASK:\n\
         - For \"how many\" questions: Count the emails that match based on subject/content\n\
         - For other questions: Extract and summarize the relevant information\n\
         - Be specific and cite emails by their numbers\n\n\
         ===== EMAILS FROM USER'S MAILBOX =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n\n\
         Analyzing the emails above:{history_context}",
    );

    let answer = match ctx.llm.generate(&prompt).await {
        Ok(answer) => answer,
        Err(e) => {
            return QueryResponse::empty(
                format!("Failed to generate answer: {}", e),
                question,
                QueryKind::Semantic,
            );
        }
    };

    // Confidence from the top score
    let top_score = similar_emails[0].1;
    let confidence = confidence_from_score(top_score);
    debug!(confidence = %confidence, "semantic query completed");

    QueryResponse::new(
        answer,
        format_scored_sources(&similar_emails),
        question,
        confidence,
        QueryKind::Semantic,
    )
}

pub fn confidence_from_score(score: f64) -> Confidence {
    if score > 0.8 {
        Confidence::High
    } else if score > 0.6 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_thresholds() {
        assert_eq!(confidence_from_score(0.9), Confidence::High);
        assert_eq!(confidence_from_score(0.8), Confidence::Medium);
        assert_eq!(confidence_from_score(0.7), Confidence::Medium);
        assert_eq!(confidence_from_score(0.6), Confidence::Low);
        assert_eq!(confidence_from_score(0.1), Confidence::Low);
    }
}
