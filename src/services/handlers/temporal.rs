//! Time-based queries, pure and content-filtered.

use super::{HandlerContext, clean_extraction_reply, format_chat_history, format_sources};
use crate::models::chat::{ChatTurn, Confidence, QueryKind, QueryResponse};
use crate::queries::messages;
use crate::services::context;
use tracing::{debug, info};

/// Stopwords dropped by the fallback keyword extractor.
const COMMON_WORDS: &[&str] = &[
    "the", "my", "me", "show", "get", "find", "what", "are", "is", "from", "about", "recent",
    "latest", "last", "most", "five", "ten", "emails", "messages", "mails",
];

/// Pure temporal: the newest messages, no content filter.
pub async fn handle(
    ctx: &HandlerContext,
    question: &str,
    limit: i64,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling pure temporal query");

    let recent = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to list emails due to database error: {}", e),
                    question,
                    QueryKind::Temporal,
                );
            }
        };
        match messages::list_messages(&mut conn, limit, 0).await {
            Ok(recent) => recent,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to list emails due to database error: {}", e),
                    question,
                    QueryKind::Temporal,
                );
            }
        }
    };

    if recent.is_empty() {
        return QueryResponse::empty(
            "I couldn't find any emails in the database.",
            question,
            QueryKind::Temporal,
        );
    }

    let email_context = context::build_context_from_messages(&recent);
    let answer = generate_temporal_answer(ctx, question, &email_context, chat_history).await;

    QueryResponse::new(
        answer,
        format_sources(&recent, 1.0),
        question,
        Confidence::High,
        QueryKind::Temporal,
    )
}

/// Filtered temporal: keyword extraction, then OR-matching search ordered by
/// date. No keywords degrades to pure temporal.
pub async fn handle_filtered(
    ctx: &HandlerContext,
    question: &str,
    limit: i64,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling filtered temporal query");

    let keywords = extract_keywords(ctx, question).await;
    if keywords.is_empty() {
        debug!("no keywords found, falling back to pure temporal");
        return handle(ctx, question, limit, chat_history).await;
    }

    debug!(keywords = ?keywords, "searching with extracted keywords");

    let emails = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::FilteredTemporal,
                );
            }
        };
        match messages::search_by_keywords(&mut conn, &keywords, limit).await {
            Ok(emails) => emails,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::FilteredTemporal,
                );
            }
        }
    };

    if emails.is_empty() {
        return QueryResponse::empty(
            format!(
                "I couldn't find any emails matching '{}' in the database.",
                keywords.join(", ")
            ),
            question,
            QueryKind::FilteredTemporal,
        );
    }

    let email_context = context::build_context_from_messages(&emails);
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "You are an email assistant with direct access to the user's email database.\n\n\
         The emails below match the keywords \"{keywords}\" and are sorted by date, newest \
         first. Analyze them to answer the question.\n\n\
         ===== MATCHING EMAILS (newest first) =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n{history_context}",
        keywords = keywords.join(", "),
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
        QueryKind::FilteredTemporal,
    )
}

async fn generate_temporal_answer(
    ctx: &HandlerContext,
    question: &str,
    email_context: &str,
    chat_history: &[ChatTurn],
) -> String {
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "You are an email assistant with direct access to the user's email database.\n\n\
         I am providing you with the user's actual emails from their database. You MUST \
         analyze these emails to answer their question.\n\n\
         ===== USER'S EMAILS (sorted by date, newest first) =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n{history_context}",
    );

    ctx.llm
        .generate(&prompt)
        .await
        .unwrap_or_else(|e| format!("Failed to generate answer: {}", e))
}

/// Extracts 1-3 search keywords via the LLM, with a stopword-stripping
/// fallback when the call fails.
async fn extract_keywords(ctx: &HandlerContext, question: &str) -> Vec<String> {
    let prompt = format!(
        "Extract the key search terms from this email query. Return ONLY the \
         keywords/phrases, nothing else.\n\n\
         User question: \"{question}\"\n\n\
         Return 1-3 keywords separated by commas. Examples: \"uber eats\" or \
         \"amazon, delivery\" or \"linkedin\"\n\nKeywords:",
    );

    match ctx
        .llm
        .classify("You are a precise extraction assistant. Return only the requested information with no explanations or preambles.", &prompt)
        .await
    {
        Ok(reply) => {
            let keywords = parse_keywords(&reply);
            debug!(keywords = ?keywords, "LLM extracted keywords");
            if keywords.is_empty() {
                extract_keywords_fallback(question)
            } else {
                keywords
            }
        }
        Err(e) => {
            debug!("keyword extraction failed ({}), using fallback", e);
            extract_keywords_fallback(question)
        }
    }
}

/// Parses a comma/newline separated keyword reply, deduplicated, max 3.
pub fn parse_keywords(reply: &str) -> Vec<String> {
    let mut cleaned = reply.trim().to_lowercase();
    for noise in [
        "sure", "here are", "keywords:", "the keywords", "extracted", "email query", "are:",
    ] {
        cleaned = cleaned.replace(noise, "");
    }

    let mut keywords = Vec::new();
    for part in cleaned.replace('\n', ",").split(',') {
        let keyword = clean_extraction_reply(part, &[]);
        let keyword = keyword.trim_matches('-').trim().to_string();
        if keyword.len() > 2 && !["the", "and", "or"].contains(&keyword.as_str())
            && !keywords.contains(&keyword)
        {
            keywords.push(keyword);
        }
        if keywords.len() == 3 {
            break;
        }
    }
    keywords
}

/// Fallback: drop stopwords, keep words longer than three characters.
pub fn extract_keywords_fallback(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split_whitespace()
        .filter(|word| !COMMON_WORDS.contains(word) && word.len() > 3)
        .map(str::to_string)
        .take(3)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keywords_comma_separated() {
        assert_eq!(parse_keywords("uber eats, delivery"), vec!["uber eats", "delivery"]);
    }

    #[test]
    fn test_parse_keywords_strips_noise() {
        assert_eq!(parse_keywords("Keywords: linkedin"), vec!["linkedin"]);
        assert_eq!(parse_keywords("extracted: \"amazon\""), vec!["amazon"]);
    }

    #[test]
    fn test_parse_keywords_dedupes_and_caps() {
        let parsed = parse_keywords("a1a, b2b, a1a, c3c, d4d");
        assert_eq!(parsed, vec!["a1a", "b2b", "c3c"]);
    }

    #[test]
    fn test_parse_keywords_drops_short_tokens() {
        assert!(parse_keywords("a, or, the").is_empty());
    }

    #[test]
    fn test_fallback_strips_stopwords() {
        let keywords = extract_keywords_fallback("show me the five most recent uber eats mails");
        assert_eq!(keywords, vec!["uber", "eats"]);
    }
}
