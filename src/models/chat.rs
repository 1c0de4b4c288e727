use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session summary row for listings (includes the message count aggregate).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSessionSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_session_id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub sources: Option<serde_json::Value>,
    pub confidence: Option<String>,
    pub query_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A single prior exchange entry passed down the handler chain for pronoun
/// resolution. Handlers look at the last few of these; nothing is stashed in
/// ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// The eight recognized query types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QueryKind {
    Conversation,
    Aggregation,
    SearchBySender,
    SearchByAttachment,
    Classification,
    FilteredTemporal,
    Temporal,
    Semantic,
}

impl QueryKind {
    pub const ALL: [QueryKind; 8] = [
        QueryKind::Conversation,
        QueryKind::Aggregation,
        QueryKind::SearchBySender,
        QueryKind::SearchByAttachment,
        QueryKind::Classification,
        QueryKind::FilteredTemporal,
        QueryKind::Temporal,
        QueryKind::Semantic,
    ];
}

/// Qualitative answer confidence, derived from the top similarity score for
/// semantic queries and by rule for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

/// Source email metadata attached to an answer. Non-semantic handlers report
/// similarity 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub message_id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub snippet: Option<String>,
    pub similarity: f64,
    pub date: Option<i64>,
}

/// The response contract shared by every query handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub question: String,
    pub confidence: Confidence,
    pub query_type: QueryKind,
    /// Full matching population for classification queries; the context only
    /// ever sees a bounded sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
}

impl QueryResponse {
    pub fn new(
        answer: impl Into<String>,
        sources: Vec<Source>,
        question: impl Into<String>,
        confidence: Confidence,
        query_type: QueryKind,
    ) -> Self {
        Self {
            answer: answer.into(),
            sources,
            question: question.into(),
            confidence,
            query_type,
            total_count: None,
        }
    }

    /// A none-confidence answer with no sources, used for failed extractions
    /// and recovered errors so handlers never crash the request.
    pub fn empty(
        answer: impl Into<String>,
        question: impl Into<String>,
        query_type: QueryKind,
    ) -> Self {
        Self::new(answer, Vec::new(), question, Confidence::None, query_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_query_kind_round_trips_kebab_case() {
        assert_eq!(QueryKind::SearchBySender.to_string(), "search-by-sender");
        assert_eq!(
            QueryKind::from_str("filtered-temporal").unwrap(),
            QueryKind::FilteredTemporal
        );
        for kind in QueryKind::ALL {
            assert_eq!(QueryKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_chat_role_serialization() {
        assert_eq!(ChatRole::User.to_string(), "user");
        assert_eq!(ChatRole::from_str("assistant").unwrap(), ChatRole::Assistant);
    }

    #[test]
    fn test_confidence_serialization() {
        assert_eq!(Confidence::None.to_string(), "none");
        assert_eq!(Confidence::from_str("medium").unwrap(), Confidence::Medium);
    }
}
