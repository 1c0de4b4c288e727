//! Formats retrieved messages into LLM-consumable context blocks.

use crate::models::message::{MailMessage, format_internal_date};

/// Builds context from scored retrieval results, one numbered block per
/// message with its relevance score. Input order is preserved.
pub fn build_context(similar_emails: &[(MailMessage, f64)]) -> String {
    similar_emails
        .iter()
        .enumerate()
        .map(|(idx, (email, score))| format_email(idx + 1, email, Some(*score)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds context from plain messages (no scores). Input order is preserved.
pub fn build_context_from_messages(messages: &[MailMessage]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(idx, email)| format_email(idx + 1, email, None))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_email(idx: usize, email: &MailMessage, score: Option<f64>) -> String {
    let header = match score {
        Some(score) => format!("Email {} (Relevance: {:.2}):", idx, score),
        None => format!("Email {}:", idx),
    };

    // Full body text beats the snippet when the payload has one
    let content = {
        let body = email.body_text();
        if body.is_empty() {
            "No content available".to_string()
        } else {
            body
        }
    };

    format!(
        "{header}\nSubject: {subject}\nFrom: {from}\nDate: {date}\nContent: {content}\n",
        header = header,
        subject = email.subject.as_deref().unwrap_or("No subject"),
        from = email.from_addr.as_deref().unwrap_or("Unknown"),
        date = format_internal_date(email.internal_date),
        content = content,
    )
}
