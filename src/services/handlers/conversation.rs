//! Conversational queries: greetings, thanks, help. No storage access.

use super::HandlerContext;
use crate::models::chat::{Confidence, QueryKind, QueryResponse};
use tracing::info;

const HELP_TEXT: &str = "I can help you with:\n\
• Finding recent emails: \"show me my latest emails\"\n\
• Searching by sender: \"all emails from john@company.com\"\n\
• Content search: \"emails about meetings\"\n\
• Statistics: \"how many emails do I get per day?\"\n\
• Filtered searches: \"recent uber eats emails\"\n\
• Finding attachments: \"emails with PDFs\"\n\n\
Just ask me anything about your emails!";

pub async fn handle(ctx: &HandlerContext, question: &str) -> QueryResponse {
    info!("Handling conversational query");

    if ctx.llm.provider() == crate::services::llm::LlmProvider::Rules {
        let answer = fallback_response(question);
        return QueryResponse::new(
            answer,
            Vec::new(),
            question,
            Confidence::High,
            QueryKind::Conversation,
        );
    }

    let prompt = format!(
        "You are a friendly email assistant. Reply briefly and helpfully to this message. \
         If the user asks what you can do, mention searching emails, finding messages from \
         specific senders, and inbox statistics.\n\nMessage: {}",
        question
    );

    let answer = match ctx.llm.generate(&prompt).await {
        Ok(answer) if !answer.trim().is_empty() => answer,
        _ => fallback_response(question),
    };

    QueryResponse::new(answer, Vec::new(), question, Confidence::High, QueryKind::Conversation)
}

/// Canned responses by coarse intent, used for the rules provider and on
/// generation failure.
pub fn fallback_response(question: &str) -> String {
    let question_lower = question.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| question_lower.contains(w));

    if contains_any(&["hello", "hi", "hey"]) {
        "Hello! I'm your email assistant. I can help you search your emails, find specific \
         messages, get statistics about your inbox, and answer questions about your email \
         content. What would you like to know?"
            .to_string()
    } else if contains_any(&["thank", "thanks"]) {
        "You're welcome! Let me know if you need anything else.".to_string()
    } else if contains_any(&["help", "what can you", "how does", "how do"]) {
        HELP_TEXT.to_string()
    } else {
        "I'm here to help! You can ask me about your emails, search for specific messages, \
         or get statistics about your inbox. What would you like to know?"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_greeting() {
        assert!(fallback_response("hi there").starts_with("Hello!"));
    }

    #[test]
    fn test_fallback_thanks() {
        assert!(fallback_response("thanks a lot").starts_with("You're welcome"));
    }

    #[test]
    fn test_fallback_help() {
        assert!(fallback_response("what can you do?").contains("Searching by sender"));
    }

    #[test]
    fn test_fallback_other() {
        assert!(fallback_response("hmm").starts_with("I'm here to help"));
    }
}
