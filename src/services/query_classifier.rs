//! Routes a natural-language question to one of the eight query types.
//!
//! Order of attack: the domain term → label map short-circuits to
//! `classification`; otherwise the LLM classifies with a fixed prompt, whose
//! reply is parsed leniently; on any failure a keyword heuristic decides.

use crate::models::chat::{ChatTurn, QueryKind};
use crate::models::classification::is_classification_query;
use crate::services::llm::LlmGateway;
use std::str::FromStr;
use tracing::{debug, info, warn};

const CLASSIFIER_SYSTEM_MESSAGE: &str =
    "You are a helpful assistant that provides concise answers.";

fn classification_prompt(question: &str, chat_context: &str) -> String {
    format!(
        "{chat_context}Classify this email question into exactly one of these types:\n\
         - conversation: greetings, thanks, help requests\n\
         - aggregation: counts, statistics, totals (\"how many\", \"who emails me most\")\n\
         - search-by-sender: all mail from a specific sender\n\
         - search-by-attachment: mail with attachments\n\
         - filtered-temporal: recent/latest mail about a specific topic or sender\n\
         - temporal: recent/latest mail with no content filter\n\
         - semantic: content questions answered from email text\n\n\
         Question: \"{question}\"\n\n\
         Respond with only the type name.",
    )
}

/// Detects the query type for a question, using the last two exchanges of
/// chat history for pronoun resolution on follow-ups.
pub async fn detect_query_type(
    llm: &LlmGateway,
    question: &str,
    chat_history: &[ChatTurn],
) -> QueryKind {
    info!("Classifying query: '{}'", question);

    // Domain label terms win outright
    if is_classification_query(question) {
        info!("Detected 'classification' via label term map");
        return QueryKind::Classification;
    }

    let chat_context = build_chat_context(chat_history);
    let prompt = classification_prompt(question, &chat_context);

    match llm.classify(CLASSIFIER_SYSTEM_MESSAGE, &prompt).await {
        Ok(response) => {
            let detected = parse_classification(&response);
            info!(kind = %detected, "LLM classified query");
            detected
        }
        Err(e) => {
            warn!("LLM query classification failed ({}), using heuristic fallback", e);
            let fallback = fallback_classification(question);
            info!(kind = %fallback, "heuristic classified query");
            fallback
        }
    }
}

/// The last two exchanges (four messages), truncated, for the prompt.
fn build_chat_context(chat_history: &[ChatTurn]) -> String {
    if chat_history.len() < 2 {
        return String::new();
    }

    let recent = &chat_history[chat_history.len().saturating_sub(4)..];
    let lines: Vec<String> = recent
        .iter()
        .map(|turn| {
            let content: String = turn.content.chars().take(100).collect();
            format!("{}: {}", turn.role, content)
        })
        .collect();

    format!("Previous conversation context:\n{}\n", lines.join("\n"))
}

/// Parses an LLM classification reply: strip preambles, take the first
/// token, strip punctuation, normalize underscores, then fall back to
/// scanning the whole response and a short word map.
pub fn parse_classification(classification: &str) -> QueryKind {
    let mut cleaned = classification.to_lowercase().trim().to_string();

    const PREFIXES: &[&str] = &[
        "the answer is",
        "answer is",
        "classification:",
        "type:",
        "the type is",
        "this is a",
        "this is",
        "i would classify this as",
        "i classify this as",
    ];
    for prefix in PREFIXES {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim().to_string();
        }
    }

    let first_word = cleaned
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| ".,!?\":;()[]{}'".contains(c))
        .replace('_', "-");

    debug!(first_word = %first_word, "parsed classification token");

    if let Ok(kind) = QueryKind::from_str(&first_word) {
        return kind;
    }

    // Search the whole response for a valid type
    for kind in QueryKind::ALL {
        if cleaned.contains(&kind.to_string()) {
            return kind;
        }
    }

    // Common word mappings
    match first_word.as_str() {
        "recent" | "latest" | "newest" | "oldest" => return QueryKind::FilteredTemporal,
        "count" => return QueryKind::Aggregation,
        "hello" | "hi" | "thanks" | "help" => return QueryKind::Conversation,
        _ => {}
    }

    if cleaned.contains("statistic") || cleaned.contains("count") {
        QueryKind::Aggregation
    } else if cleaned.contains("sender") {
        QueryKind::SearchBySender
    } else if cleaned.contains("attachment") {
        QueryKind::SearchByAttachment
    } else {
        debug!("unexpected classification '{}', defaulting to semantic", classification);
        QueryKind::Semantic
    }
}

/// Keyword heuristics used when the LLM is unavailable.
pub fn fallback_classification(question: &str) -> QueryKind {
    let question_lower = question.to_lowercase();
    let contains_any =
        |words: &[&str]| words.iter().any(|w| question_lower.contains(w));

    if contains_any(&["hello", "hi", "thanks", "thank you", "help", "what can you"]) {
        return QueryKind::Conversation;
    }

    if contains_any(&["how many", "count", "number of"]) {
        return QueryKind::Aggregation;
    }

    let has_temporal = contains_any(&["recent", "latest", "last", "newest", "first", "oldest"]);
    // Common brand senders count as a content filter alongside from/about
    let has_content_filter = contains_any(&["from", "about", "uber", "amazon", "linkedin"])
        || question_lower.contains('@');

    if has_temporal && has_content_filter {
        QueryKind::FilteredTemporal
    } else if has_temporal {
        QueryKind::Temporal
    } else {
        QueryKind::Semantic
    }
}

/// True when a short question reads as a continuation of the conversation:
/// an explicit back-reference, a pronoun follow-up, or an ambiguous action on
/// a number, provided there is history to continue from.
pub fn is_contextual_followup(question: &str, chat_history: &[ChatTurn]) -> bool {
    let has_history = chat_history.len() >= 2;
    if !has_history {
        return false;
    }

    let question_lower = question.to_lowercase();
    let word_count = question.split_whitespace().count();
    let contains_any =
        |words: &[&str]| words.iter().any(|w| question_lower.contains(w));

    let has_contextual_reference = contains_any(&[
        "of those", "from those", "among them", "of them", "out of", "of the",
    ]);

    let is_simple_followup = word_count <= 6
        && contains_any(&["who", "what", "which", "how many", "count"])
        && !contains_any(&["all", "total", "every", "overall", "in general", "in my"]);

    let has_pronouns = contains_any(&["them", "those", "they"]);

    let has_numeric_reference = question.chars().any(|c| c.is_ascii_digit());
    let is_ambiguous_continuation = word_count <= 4
        && has_numeric_reference
        && !contains_any(&["total", "overall", "all", "every"])
        && contains_any(&["do", "show", "list", "get"]);

    has_contextual_reference
        || (is_simple_followup && has_pronouns)
        || is_ambiguous_continuation
}
