//! Search for all mail from a specific sender.

use super::{HandlerContext, clean_extraction_reply, format_chat_history, format_sources};
use crate::error::{Error, Result};
use crate::models::chat::{ChatTurn, Confidence, QueryKind, QueryResponse};
use crate::queries::messages;
use crate::services::context;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Tokens that signal a failed extraction rather than a sender.
const BANNED_TOKENS: &[&str] = &["the", "a", "an", "my", "show", "all"];

pub async fn handle(
    ctx: &HandlerContext,
    question: &str,
    limit: i64,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling sender search");

    // An explicit "last N" / "show N" / "N emails" in the question overrides
    // the default result cap
    let limit = extract_number_from_query(question).unwrap_or(limit);

    let sender = match extract_sender(ctx, question, chat_history).await {
        Ok(sender) => sender,
        Err(e) => {
            debug!("sender extraction failed: {}", e);
            return QueryResponse::empty(
                "I couldn't determine which sender you're looking for. Please be more specific.",
                question,
                QueryKind::SearchBySender,
            );
        }
    };

    let emails = {
        let mut conn = match ctx.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::SearchBySender,
                );
            }
        };
        match messages::search_by_sender(&mut conn, &sender, limit).await {
            Ok(emails) => emails,
            Err(e) => {
                return QueryResponse::empty(
                    format!("Failed to search emails due to database error: {}", e),
                    question,
                    QueryKind::SearchBySender,
                );
            }
        }
    };

    if emails.is_empty() {
        return QueryResponse::empty(
            format!("I couldn't find any emails from '{}'.", sender),
            question,
            QueryKind::SearchBySender,
        );
    }

    let email_context = context::build_context_from_messages(&emails);
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "You are an email assistant with direct access to the user's email database.\n\n\
         The emails below are from \"{sender}\", sorted by date, newest first. Analyze them \
         to answer the question.\n\n\
         ===== EMAILS FROM {sender} =====\n\n{email_context}\n\n\
         ===== USER QUESTION =====\n\n{question}\n\n\
         ===== YOUR ANSWER =====\n{history_context}",
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
        QueryKind::SearchBySender,
    )
}

/// Extracts the sender via the LLM, with recent history included so pronouns
/// ("them", "that company") resolve. Fails on banned or too-short tokens.
async fn extract_sender(
    ctx: &HandlerContext,
    question: &str,
    chat_history: &[ChatTurn],
) -> Result<String> {
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "Extract sender from: \"{question}\"\n\n\
         Examples:\n\
         - \"emails from uber\" → uber\n\
         - \"all from amazon\" → amazon\n\
         - \"linkedin messages\" → linkedin\n\
         - \"john@company.com emails\" → john@company.com\n\n\
         Sender name only:{history_context}",
    );

    let reply = ctx
        .llm
        .classify(
            "You are a precise extraction assistant. Follow instructions exactly. \
             Return only the requested information with no explanations or preambles.",
            &prompt,
        )
        .await?;

    let sender = clean_sender_reply(&reply);

    validate_sender(&sender)?;
    info!("Extracted sender: '{}'", sender);
    Ok(sender)
}

/// Strips preambles and wrapping punctuation from the full extraction reply.
/// Multi-word senders ("uber eats") survive intact.
fn clean_sender_reply(reply: &str) -> String {
    clean_extraction_reply(reply, &["the sender is", "sender:", "sender is", "the"])
}

fn validate_sender(sender: &str) -> Result<()> {
    if sender.len() < 2 || BANNED_TOKENS.contains(&sender.to_lowercase().as_str()) {
        return Err(Error::InvalidInput(format!(
            "invalid sender extracted: '{}'",
            sender
        )));
    }
    Ok(())
}

/// Parses an explicit result cap: "last 10", "show 20", "5 emails". Only
/// values 1-100 are honored.
pub fn extract_number_from_query(question: &str) -> Option<i64> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(?:last|recent|latest)\s+(\d+)\b").unwrap(),
            Regex::new(r"(?i)\b(?:show|get|find)\s+(?:me\s+)?(\d+)\b").unwrap(),
            Regex::new(r"(?i)\b(\d+)\s+(?:emails?|messages?|mails?)\b").unwrap(),
        ]
    });

    for pattern in patterns {
        if let Some(captures) = pattern.captures(question) {
            if let Ok(num) = captures[1].parse::<i64>() {
                if (1..=100).contains(&num) {
                    return Some(num);
                }
            }
        }
    }
    None
}
