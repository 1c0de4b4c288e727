//! Statistical queries: topic counts, top senders, daily volume, unread and
//! total counts.

use super::{HandlerContext, clean_extraction_reply, format_chat_history};
use crate::models::chat::{ChatTurn, Confidence, QueryKind, QueryResponse};
use crate::queries::messages;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, info};

const EXTRACTION_SYSTEM_MESSAGE: &str =
    "You are a precise extraction assistant. Follow instructions exactly. \
     Return only the requested information with no explanations or preambles.";

fn ok(answer: String, question: &str) -> QueryResponse {
    QueryResponse::new(answer, Vec::new(), question, Confidence::High, QueryKind::Aggregation)
}

fn db_error(e: impl std::fmt::Display, question: &str) -> QueryResponse {
    QueryResponse::empty(
        format!("Failed to compute statistics due to database error: {}", e),
        question,
        QueryKind::Aggregation,
    )
}

pub async fn handle(
    ctx: &HandlerContext,
    question: &str,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    info!("Handling aggregation query");
    let question_lower = question.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| question_lower.contains(w));

    // "how many <topic>" comes first, unless it is one of the dedicated stats
    if question_lower.contains("how many")
        && !contains_any(&["total", "per day", "unread"])
    {
        if let Some(response) = handle_topic_count(ctx, question, chat_history).await {
            return response;
        }
        // Topic extraction failed; fall through to the standard routes
    }

    if contains_any(&[
        "who sends",
        "who sent",
        "whos sent",
        "who emails me most",
        "most common sender",
        "top sender",
        "which sender",
        "what sender",
    ]) {
        handle_top_senders(ctx, question, chat_history).await
    } else if contains_any(&["per day", "daily"]) {
        handle_daily_stats(ctx, question).await
    } else if question_lower.contains("how many")
        && contains_any(&["unread", "not read"])
    {
        handle_unread_count(ctx, question).await
    } else if contains_any(&["how many", "total"]) {
        handle_total_count(ctx, question).await
    } else {
        handle_generic(ctx, question).await
    }
}

/// Counts emails matching an extracted topic. Returns None when extraction
/// fails so the caller can fall through.
async fn handle_topic_count(
    ctx: &HandlerContext,
    question: &str,
    chat_history: &[ChatTurn],
) -> Option<QueryResponse> {
    let topic = extract_topic(ctx, question, chat_history).await?;

    let mut conn = ctx.conn().await.ok()?;
    let count = match messages::count_by_topic(&mut conn, &topic).await {
        Ok(count) => count,
        Err(e) => {
            debug!("topic count failed: {}", e);
            return None;
        }
    };

    debug!("found {} emails matching '{}'", count, topic);
    Some(ok(
        format!("You have {} emails related to '{}'.", count, topic),
        question,
    ))
}

/// Extracts the topic of a counting query via the LLM, cleaned up, with a
/// keyword fallback for nonsense replies.
async fn extract_topic(
    ctx: &HandlerContext,
    question: &str,
    chat_history: &[ChatTurn],
) -> Option<String> {
    let history_context = format_chat_history(chat_history);
    let prompt = format!(
        "Extract the topic or sender from this counting query.\n\n\
         Question: \"{question}\"\n\n\
         Examples:\n\
         - \"how many uber emails do I have\" → uber\n\
         - \"how many job rejections\" → job rejections\n\
         - \"count my amazon orders\" → amazon\n\n\
         Your answer (topic only):{history_context}",
    );

    let reply = match ctx.llm.classify(EXTRACTION_SYSTEM_MESSAGE, &prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("topic extraction failed ({}), using keyword fallback", e);
            return extract_topic_fallback(question);
        }
    };

    let topic = clean_topic_reply(&reply);
    debug!("cleaned topic: '{}'", topic);

    if topic.len() < 2 || topic.len() > 50 {
        return None;
    }

    // Nonsense replies mean the model did not find a topic either
    let topic_lower = topic.to_lowercase();
    if ["not provided", "cannot", "company/sender", "context"]
        .iter()
        .any(|w| topic_lower.contains(w))
    {
        return extract_topic_fallback(question);
    }

    Some(topic)
}

/// Strips verbose framing from a topic reply and compresses multi-word
/// answers down to the informative words.
pub fn clean_topic_reply(reply: &str) -> String {
    let mut topic = clean_extraction_reply(
        reply,
        &[
            "sure, here's the topic/sender from the counting query:",
            "here's the topic/sender:",
            "the topic/sender is",
            "topic/sender:",
            "the topic is",
            "topic is",
            "sender is",
            "the sender is",
            "your answer (company name only):",
            "company name only:",
            "topic:",
            "sender:",
            "keywords:",
            "sure,",
        ],
    );

    // "label: value" replies keep only the value
    if topic.matches(':').count() == 1 {
        if let Some((_, value)) = topic.split_once(':') {
            topic = value.trim().to_string();
        }
    }

    let words: Vec<&str> = topic.split_whitespace().collect();
    if words.len() > 3 {
        const FILLER: &[&str] = &[
            "the", "a", "an", "is", "are", "was", "were", "topic", "sender", "query", "counting",
            "email", "emails", "message", "messages", "mail", "mails", "from", "to", "about",
        ];
        let informative: Vec<&str> = words
            .iter()
            .filter(|w| !FILLER.contains(&w.to_lowercase().as_str()))
            .take(3)
            .copied()
            .collect();
        if !informative.is_empty() {
            topic = informative.join(" ");
        }
    }

    topic.trim().to_string()
}

/// Keyword fallback: strip stopwords, keep up to three words.
pub fn extract_topic_fallback(question: &str) -> Option<String> {
    const STOP_WORDS: &[&str] = &[
        "how", "many", "do", "i", "have", "mail", "mails", "email", "emails", "message",
        "messages", "my", "the", "from", "a", "an", "count",
    ];

    let keywords: Vec<String> = question
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()) && w.len() > 2)
        .take(3)
        .collect();

    if keywords.is_empty() {
        None
    } else {
        let topic = keywords.join(" ");
        debug!("fallback extracted topic: '{}'", topic);
        Some(topic)
    }
}

async fn handle_top_senders(
    ctx: &HandlerContext,
    question: &str,
    chat_history: &[ChatTurn],
) -> QueryResponse {
    let question_lower = question.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| question_lower.contains(w));

    // A back-reference or a bare "who sends the most?" follow-up pulls the
    // topic filter from the conversation
    let has_context_reference = contains_any(&[
        "out of", "from those", "of them", "of the", "among", "from the",
    ]);
    let is_simple_followup = question.split_whitespace().count() <= 5
        && question_lower.contains("the most")
        && !contains_any(&["all", "total", "every"]);

    let topic = if (has_context_reference || is_simple_followup) && !chat_history.is_empty() {
        extract_topic_from_history(chat_history)
    } else {
        None
    };

    let mut conn = match ctx.conn().await {
        Ok(conn) => conn,
        Err(e) => return db_error(e, question),
    };

    if let Some(topic) = topic {
        info!("top senders filtered by topic '{}'", topic);
        let emails =
            match messages::search_by_keywords(&mut conn, &[topic.clone()], 1000).await {
                Ok(emails) => emails,
                Err(e) => return db_error(e, question),
            };

        let mut sender_counts: HashMap<String, i64> = HashMap::new();
        for email in &emails {
            let sender = email.from_addr.clone().unwrap_or_else(|| "Unknown".to_string());
            *sender_counts.entry(sender).or_insert(0) += 1;
        }

        let mut sorted: Vec<(String, i64)> = sender_counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sorted.truncate(10);

        if sorted.is_empty() {
            return ok(
                format!("I couldn't find any emails matching '{}'.", topic),
                question,
            );
        }

        let listing = sorted
            .iter()
            .enumerate()
            .map(|(i, (sender, count))| format!("{}. {}: {} emails", i + 1, sender, count))
            .collect::<Vec<_>>()
            .join("\n");
        return ok(
            format!("Top senders for '{}' emails:\n{}", topic, listing),
            question,
        );
    }

    let rows = match messages::get_top_senders(&mut conn, 10).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e, question),
    };

    if rows.is_empty() {
        return ok("I couldn't find sender statistics.".to_string(), question);
    }

    let listing = rows
        .iter()
        .enumerate()
        .map(|(i, row)| format!("{}. {}: {} emails", i + 1, row.from_addr, row.count))
        .collect::<Vec<_>>()
        .join("\n");
    ok(format!("Your top email senders:\n{}", listing), question)
}

/// Scans recent history, newest first, for a topic the conversation was
/// about: promo mentions, "about X" phrases, or "N <topic> emails" patterns.
pub fn extract_topic_from_history(chat_history: &[ChatTurn]) -> Option<String> {
    static COUNT_PATTERN: OnceLock<Regex> = OnceLock::new();
    static HOW_MANY_PATTERN: OnceLock<Regex> = OnceLock::new();
    let count_pattern = COUNT_PATTERN
        .get_or_init(|| Regex::new(r"(\d+)\s+(\w+)\s+(?:email|message)").unwrap());
    let how_many_pattern = HOW_MANY_PATTERN
        .get_or_init(|| Regex::new(r"how many\s+(\w+)\s+(?:mail|email|message)").unwrap());

    let recent = &chat_history[chat_history.len().saturating_sub(6)..];

    for turn in recent.iter().rev() {
        let content = turn.content.to_lowercase();

        // Generic clarifying answers carry no topic
        if turn.role == crate::models::chat::ChatRole::Assistant
            && content.contains("could you be more specific")
        {
            continue;
        }

        if ["promotion", "promotional", "promo"]
            .iter()
            .any(|w| content.contains(w))
        {
            return Some("promo".to_string());
        }

        for phrase in ["related to", "about", "regarding", "concerning"] {
            if let Some((_, after)) = content.split_once(phrase) {
                if let Some(word) = after.split_whitespace().next() {
                    let topic = word.trim_matches(|c: char| "'\".,!?".contains(c));
                    if topic.len() > 2 && !["the", "my", "your"].contains(&topic) {
                        return Some(topic.to_string());
                    }
                }
            }
        }

        if let Some(captures) = count_pattern.captures(&content) {
            let topic = &captures[2];
            if !["total", "unread", "new", "have", "got"].contains(&topic) {
                return Some(topic.to_string());
            }
        }

        if turn.role == crate::models::chat::ChatRole::User {
            if let Some(captures) = how_many_pattern.captures(&content) {
                let topic = &captures[1];
                if !["total", "unread", "new"].contains(&topic) {
                    return Some(topic.to_string());
                }
            }
        }
    }

    None
}

async fn handle_daily_stats(ctx: &HandlerContext, question: &str) -> QueryResponse {
    let mut conn = match ctx.conn().await {
        Ok(conn) => conn,
        Err(e) => return db_error(e, question),
    };
    let rows = match messages::get_daily_email_stats(&mut conn, 30).await {
        Ok(rows) => rows,
        Err(e) => return db_error(e, question),
    };

    if rows.is_empty() {
        return ok("I couldn't calculate email statistics.".to_string(), question);
    }

    let total: i64 = rows.iter().map(|r| r.count).sum();
    let avg_per_day = total as f64 / rows.len() as f64;
    ok(
        format!(
            "You receive an average of {:.1} emails per day (based on the last 30 days).",
            avg_per_day
        ),
        question,
    )
}

async fn handle_unread_count(ctx: &HandlerContext, question: &str) -> QueryResponse {
    let mut conn = match ctx.conn().await {
        Ok(conn) => conn,
        Err(e) => return db_error(e, question),
    };
    match messages::get_unread_count(&mut conn).await {
        Ok(count) => ok(format!("You have {} unread emails.", count), question),
        Err(e) => db_error(e, question),
    }
}

async fn handle_total_count(ctx: &HandlerContext, question: &str) -> QueryResponse {
    let mut conn = match ctx.conn().await {
        Ok(conn) => conn,
        Err(e) => return db_error(e, question),
    };
    match messages::get_total_message_count(&mut conn).await {
        Ok(count) => ok(
            format!("You have {} total emails in your database.", count),
            question,
        ),
        Err(e) => db_error(e, question),
    }
}

async fn handle_generic(ctx: &HandlerContext, question: &str) -> QueryResponse {
    let mut conn = match ctx.conn().await {
        Ok(conn) => conn,
        Err(e) => return db_error(e, question),
    };
    match messages::get_total_message_count(&mut conn).await {
        Ok(total) => ok(
            format!(
                "I found {} emails in your database. Could you be more specific about what \
                 statistics you'd like?",
                total
            ),
            question,
        ),
        Err(e) => db_error(e, question),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::ChatTurn;

    #[test]
    fn test_clean_topic_reply_prefixes() {
        assert_eq!(clean_topic_reply("The topic is uber"), "uber");
        assert_eq!(clean_topic_reply("Topic: \"amazon\""), "amazon");
    }

    #[test]
    fn test_clean_topic_reply_compresses_verbose_answers() {
        assert_eq!(
            clean_topic_reply("the topic from the counting query is uber eats"),
            "uber eats"
        );
    }

    #[test]
    fn test_extract_topic_fallback() {
        assert_eq!(
            extract_topic_fallback("how many uber emails do I have?"),
            Some("uber".to_string())
        );
        assert_eq!(extract_topic_fallback("how many do i have"), None);
    }

    #[test]
    fn test_history_topic_promo() {
        let history = vec![
            ChatTurn::user("how many promotional emails?"),
            ChatTurn::assistant("You have 198 promotional emails."),
        ];
        assert_eq!(extract_topic_from_history(&history), Some("promo".to_string()));
    }

    #[test]
    fn test_history_topic_about_phrase() {
        let history = vec![
            ChatTurn::user("tell me about linkedin please"),
            ChatTurn::assistant("Sure."),
        ];
        assert_eq!(
            extract_topic_from_history(&history),
            Some("linkedin".to_string())
        );
    }

    #[test]
    fn test_history_topic_count_pattern() {
        let history = vec![
            ChatTurn::user("hello"),
            ChatTurn::assistant("Found 42 uber emails for you."),
        ];
        assert_eq!(extract_topic_from_history(&history), Some("uber".to_string()));
    }

    #[test]
    fn test_history_topic_none() {
        let history = vec![ChatTurn::user("hello"), ChatTurn::assistant("hi!")];
        assert_eq!(extract_topic_from_history(&history), None);
    }
}
