//! Message classification: prompt contract, response normalization, and the
//! rule-based fallback used when the provider is `rules`.

use crate::error::{Error, Result};
use crate::models::classification::{ALLOWED_LABELS, ClassificationOutcome, Priority, is_allowed_label};
use crate::services::llm::{LlmGateway, LlmProvider};
use serde_json::Value;
use tracing::debug;

/// Only this much body text goes into the prompt.
const BODY_PROMPT_LIMIT: usize = 2000;

pub const CLASSIFICATION_SYSTEM_MESSAGE: &str =
    "You are an email classification assistant. You label emails precisely and \
     respond only with JSON.";

/// Builds the user prompt: allowed labels, subject, bounded body, and the
/// exact output shape.
pub fn build_classification_prompt(subject: &str, body: &str) -> String {
    let body: String = body.chars().take(BODY_PROMPT_LIMIT).collect();
    format!(
        "Classify this email.\n\n\
         Allowed labels (use only these): {labels}\n\n\
         Subject: {subject}\n\
         Body: {body}\n\n\
         Return only a JSON object of the exact shape \
         {{\"labels\": [...], \"priority\": \"high|normal|low\", \"summary\": \"...\"}} \
         with a summary of at most two sentences.",
        labels = ALLOWED_LABELS.join(", "),
        subject = subject,
        body = body,
    )
}

/// Classifies `(subject, body)` through the gateway, normalizing the model's
/// reply. Parse and provider errors surface to the caller; the sync worker
/// counts them per message and moves on.
pub async fn classify_message(
    llm: &LlmGateway,
    subject: &str,
    body: &str,
) -> Result<ClassificationOutcome> {
    match llm.provider() {
        LlmProvider::Rules => Ok(rule_based(subject, body)),
        LlmProvider::Command => {
            let raw = llm.run_command(subject, body).await?;
            parse_llm_response(&raw)
        }
        _ => {
            let prompt = build_classification_prompt(subject, body);
            let raw = llm.classify(CLASSIFICATION_SYSTEM_MESSAGE, &prompt).await?;
            parse_llm_response(&raw)
        }
    }
}

/// Strips Markdown code fences, generic and JSON-tagged.
fn strip_code_fences(content: &str) -> &str {
    let content = content.trim();
    if let Some(start) = content.find("```json") {
        let rest = &content[start + 7..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    if let Some(start) = content.find("```") {
        let rest = &content[start + 3..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    content
}

/// Normalizes an LLM classification reply into the persisted shape:
/// singular `label` folds into `labels`, labels are lowercased and filtered
/// through the whitelist (unknowns dropped silently), priority folds to
/// {high, normal, low}, and `summary` is always a string.
pub fn parse_llm_response(content: &str) -> Result<ClassificationOutcome> {
    let cleaned = strip_code_fences(content);
    let mut value: Value = serde_json::from_str(cleaned)
        .map_err(|e| Error::Llm(format!("classification response was not valid JSON: {}", e)))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::Llm("classification response was not a JSON object".to_string()))?;

    // Singular "label" key folds into "labels"
    if !object.contains_key("labels") {
        if let Some(label_value) = object.remove("label") {
            let labels = match label_value {
                Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            object.insert("labels".to_string(), Value::Array(labels));
        }
    }

    let labels: Vec<String> = match object.get("labels") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.to_lowercase().trim().to_string(),
                other => other.to_string().to_lowercase(),
            })
            .filter(|label| is_allowed_label(label))
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => {
            let lowered = s.to_lowercase().trim().to_string();
            if is_allowed_label(&lowered) {
                vec![lowered]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    };

    let priority = object
        .get("priority")
        .and_then(|p| p.as_str())
        .map(Priority::parse)
        .unwrap_or(Priority::Normal);

    let summary = match object.get("summary") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    debug!(labels = ?labels, priority = %priority, "classification parsed");

    Ok(ClassificationOutcome {
        labels,
        priority,
        summary,
    })
}

/// A small local heuristic classifier used when the provider is `rules`.
/// Keyword matching only; never selected silently for real providers.
pub fn rule_based(subject: &str, body: &str) -> ClassificationOutcome {
    let text = format!("{}\n{}", subject, body).to_lowercase();
    let contains_any = |keys: &[&str]| keys.iter().any(|k| text.contains(k));

    let mut labels = Vec::new();
    let mut priority = Priority::Normal;

    if contains_any(&["invoice", "payment", "receipt", "bill"]) {
        labels.push("finance".to_string());
    }
    if contains_any(&["password", "login", "security", "account"]) {
        labels.push("security".to_string());
        priority = Priority::High;
    }
    if contains_any(&["urgent", "asap", "immediately"]) {
        priority = Priority::High;
    }
    if contains_any(&["meeting", "schedule", "calendar"]) {
        labels.push("meetings".to_string());
    }

    if contains_any(&["thank you for applying", "application received", "applied for"]) {
        labels.push("job-application".to_string());
    }
    if contains_any(&["interview", "schedule a call", "would like to meet"]) {
        labels.push("job-interview".to_string());
    }
    if contains_any(&["job offer", "offer letter", "pleased to offer"]) {
        labels.push("job-offer".to_string());
        priority = Priority::High;
    }
    if contains_any(&["unfortunately", "not moving forward", "position has been filled"]) {
        labels.push("job-rejection".to_string());
    }
    if contains_any(&["jobs match", "new job", "job alert", "apply now"]) {
        labels.push("job-ad".to_string());
    }

    let summary = if subject.is_empty() {
        "No subject".to_string()
    } else {
        subject.chars().take(100).collect()
    };

    ClassificationOutcome {
        labels,
        priority,
        summary,
    }
}
