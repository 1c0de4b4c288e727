use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Message priority. The authoritative set is exactly {high, normal, low};
/// anything else a model produces (including legacy "medium") folds to Normal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Lenient parse used on classifier output and on legacy stored values.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

/// A persisted classification record. Append-only; a message's
/// `latest_classification_id` points at the most recent one.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Classification {
    pub id: Uuid,
    pub message_id: String,
    #[sqlx(json)]
    pub labels: Vec<String>,
    pub priority: Option<String>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Classifier output before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub labels: Vec<String>,
    pub priority: Priority,
    pub summary: String,
}

/// All allowed classification labels.
pub const ALLOWED_LABELS: &[&str] = &[
    "finance",
    "banking",
    "investments",
    "security",
    "authentication",
    "meetings",
    "appointments",
    "personal",
    "work",
    "career",
    "shopping",
    "social",
    "entertainment",
    "news",
    "newsletters",
    "promotions",
    "marketing",
    "spam",
    "travel",
    "health",
    "education",
    "legal",
    "taxes",
    "receipts",
    "notifications",
    "updates",
    "alerts",
    "support",
    "bills",
    "insurance",
    "job-application",
    "job-interview",
    "job-offer",
    "job-rejection",
    "job-ad",
    "job-followup",
];

pub fn is_allowed_label(label: &str) -> bool {
    ALLOWED_LABELS.contains(&label)
}

/// Common query terms mapped to classification labels for RAG queries.
/// Matching is case-insensitive and longest-term-first so multi-word terms
/// win over their substrings ("job rejection" before "rejection").
pub const QUERY_TO_LABEL_MAPPING: &[(&str, &str)] = &[
    ("job rejection", "job-rejection"),
    ("job rejections", "job-rejection"),
    ("rejected", "job-rejection"),
    ("rejection", "job-rejection"),
    ("job offer", "job-offer"),
    ("job offers", "job-offer"),
    ("offer", "job-offer"),
    ("interview", "job-interview"),
    ("interviews", "job-interview"),
    ("job application", "job-application"),
    ("job applications", "job-application"),
    ("applied", "job-application"),
    ("job ad", "job-ad"),
    ("job ads", "job-ad"),
    ("job alert", "job-ad"),
    ("job followup", "job-followup"),
    ("finance", "finance"),
    ("financial", "finance"),
    ("banking", "banking"),
    ("bank", "banking"),
    ("investment", "investments"),
    ("investments", "investments"),
    ("security alert", "security"),
    ("security", "security"),
    ("authentication", "authentication"),
    ("meeting", "meetings"),
    ("meetings", "meetings"),
    ("appointment", "appointments"),
    ("appointments", "appointments"),
    ("promotion", "promotions"),
    ("promotions", "promotions"),
    ("marketing", "marketing"),
    ("newsletter", "newsletters"),
    ("newsletters", "newsletters"),
    ("shopping", "shopping"),
    ("receipt", "receipts"),
    ("receipts", "receipts"),
    ("bill", "bills"),
    ("bills", "bills"),
    ("invoice", "finance"),
    ("tax", "taxes"),
    ("taxes", "taxes"),
    ("legal", "legal"),
    ("insurance", "insurance"),
    ("travel", "travel"),
    ("health", "health"),
    ("education", "education"),
    ("spam", "spam"),
    ("notification", "notifications"),
    ("notifications", "notifications"),
    ("alert", "alerts"),
    ("alerts", "alerts"),
    ("update", "updates"),
    ("updates", "updates"),
    ("support", "support"),
];

/// Extracts a classification label from a query string, longest match first.
pub fn label_from_query(query: &str) -> Option<&'static str> {
    let query_lower = query.to_lowercase();

    let mut terms: Vec<&(&str, &str)> = QUERY_TO_LABEL_MAPPING.iter().collect();
    terms.sort_by_key(|(term, _)| std::cmp::Reverse(term.len()));

    terms
        .iter()
        .find(|(term, _)| query_lower.contains(term))
        .map(|(_, label)| *label)
}

/// Maps an extracted term through the lookup table. Applied after the LLM's
/// raw output is lowercased and trimmed; unmapped terms pass through only
/// when they are already whitelisted.
pub fn map_term_to_label(term: &str) -> Option<String> {
    let term = term.trim().to_lowercase();
    if let Some((_, label)) = QUERY_TO_LABEL_MAPPING.iter().find(|(t, _)| *t == term) {
        return Some((*label).to_string());
    }
    if is_allowed_label(&term) {
        return Some(term);
    }
    None
}

/// True when a query names a known classification label.
pub fn is_classification_query(query: &str) -> bool {
    label_from_query(query).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_folds_unknowns_to_normal() {
        assert_eq!(Priority::parse("HIGH"), Priority::High);
        assert_eq!(Priority::parse("low"), Priority::Low);
        assert_eq!(Priority::parse("medium"), Priority::Normal);
        assert_eq!(Priority::parse("urgent"), Priority::Normal);
        assert_eq!(Priority::parse(""), Priority::Normal);
    }

    #[test]
    fn test_label_from_query_longest_match_first() {
        // "job rejection" must win over the shorter "rejection"
        assert_eq!(
            label_from_query("show me my job rejection emails"),
            Some("job-rejection")
        );
        assert_eq!(label_from_query("any security alert lately?"), Some("security"));
        assert_eq!(label_from_query("invoice from acme"), Some("finance"));
        assert_eq!(label_from_query("what's the weather?"), None);
    }

    #[test]
    fn test_label_from_query_case_insensitive() {
        assert_eq!(label_from_query("My FINANCE emails"), Some("finance"));
    }

    #[test]
    fn test_map_term_passes_whitelisted_terms() {
        assert_eq!(map_term_to_label("promo"), None);
        assert_eq!(map_term_to_label("promotion"), Some("promotions".to_string()));
        assert_eq!(map_term_to_label("Travel "), Some("travel".to_string()));
        assert_eq!(map_term_to_label("gibberish"), None);
    }

    #[test]
    fn test_whitelist_membership() {
        assert!(is_allowed_label("job-offer"));
        assert!(!is_allowed_label("important"));
    }
}
