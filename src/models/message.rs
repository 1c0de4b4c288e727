use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Normalized representation of a provider message for downstream processing.
///
/// The provider-assigned `id` is the conflict key on ingest; payload fields
/// are last-write-wins on re-fetch. Classification fields are populated from
/// the message's latest classification when queries join it in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    /// Provider-assigned labels (INBOX, UNREAD, ...)
    pub labels: Option<Vec<String>>,
    /// Milliseconds since epoch
    pub internal_date: Option<i64>,
    /// Opaque MIME-part tree as returned by the provider
    pub payload: Option<Value>,
    pub raw: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub has_attachments: bool,

    pub classification_labels: Option<Vec<String>>,
    pub priority: Option<String>,
    pub summary: Option<String>,
}

impl MailMessage {
    /// Builds a message from the provider's API shape.
    ///
    /// Headers come as `[{name, value}]` under the payload; the interesting
    /// ones (From/To/Subject) are lifted into dedicated fields.
    pub fn from_api_message(msg: &Value) -> Self {
        let payload = msg.get("payload").cloned();

        let mut headers = BTreeMap::new();
        if let Some(list) = payload
            .as_ref()
            .and_then(|p| p.get("headers"))
            .and_then(|h| h.as_array())
        {
            for header in list {
                if let (Some(name), Some(value)) = (
                    header.get("name").and_then(|v| v.as_str()),
                    header.get("value").and_then(|v| v.as_str()),
                ) {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }

        // internalDate is a stringified millisecond timestamp
        let internal_date = msg
            .get("internalDate")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            });

        let labels = msg.get("labelIds").and_then(|v| {
            v.as_array().map(|a| {
                a.iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
        });

        let has_attachments = payload
            .as_ref()
            .map(part_has_attachments)
            .unwrap_or(false);

        Self {
            id: msg
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            thread_id: msg
                .get("threadId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            from_addr: headers.get("From").cloned(),
            to_addr: headers.get("To").cloned(),
            subject: headers.get("Subject").cloned(),
            snippet: msg
                .get("snippet")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            labels,
            internal_date,
            payload,
            raw: msg.get("raw").and_then(|v| v.as_str()).map(str::to_string),
            headers,
            has_attachments,
            classification_labels: None,
            priority: None,
            summary: None,
        }
    }

    /// Extracts the full plain-text body from the MIME payload, preferring
    /// `text/plain` parts, falling back to the snippet.
    pub fn body_text(&self) -> String {
        let Some(payload) = &self.payload else {
            return self.snippet.clone().unwrap_or_default();
        };

        let body = extract_text_from_part(payload);
        let body = body.trim();
        if body.is_empty() {
            self.snippet.clone().unwrap_or_default()
        } else {
            body.to_string()
        }
    }
}

/// Walks one MIME part and its children, collecting decoded text.
/// `text/plain` parts sort before `text/html` fallbacks.
fn extract_text_from_part(part: &Value) -> String {
    if let Some(data) = part
        .get("body")
        .and_then(|b| b.get("data"))
        .and_then(|d| d.as_str())
    {
        if let Some(decoded) = decode_base64url(data) {
            return decoded;
        }
    }

    let mut plain = Vec::new();
    let mut rest = Vec::new();
    if let Some(parts) = part.get("parts").and_then(|p| p.as_array()) {
        for subpart in parts {
            let mime = subpart
                .get("mimeType")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            let text = if mime.contains("text/plain")
                || mime.contains("text/html")
                || mime.contains("multipart")
            {
                Some(extract_text_from_part(subpart))
            } else {
                None
            };
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                if mime.contains("text/plain") {
                    plain.push(text);
                } else {
                    rest.push(text);
                }
            }
        }
    }
    plain.extend(rest);
    plain.join("\n")
}

/// Decodes base64url body data, tolerating missing padding.
pub fn decode_base64url(data: &str) -> Option<String> {
    let mut padded = data.to_string();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }
    URL_SAFE
        .decode(padded.as_bytes())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// An attachment is any part with a non-empty filename or a
/// `Content-Disposition: attachment` header, at any nesting depth.
pub fn part_has_attachments(part: &Value) -> bool {
    if let Some(filename) = part.get("filename").and_then(|f| f.as_str()) {
        if !filename.is_empty() {
            return true;
        }
    }

    if let Some(headers) = part.get("headers").and_then(|h| h.as_array()) {
        for header in headers {
            let name = header.get("name").and_then(|n| n.as_str()).unwrap_or("");
            if name.eq_ignore_ascii_case("content-disposition") {
                let value = header.get("value").and_then(|v| v.as_str()).unwrap_or("");
                if value.to_lowercase().contains("attachment") {
                    return true;
                }
            }
        }
    }

    part.get("parts")
        .and_then(|p| p.as_array())
        .map(|parts| parts.iter().any(part_has_attachments))
        .unwrap_or(false)
}

/// Formats a millisecond epoch timestamp as `YYYY-MM-DD HH:MM`.
pub fn format_internal_date(internal_date: Option<i64>) -> String {
    match internal_date.and_then(DateTime::<Utc>::from_timestamp_millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => "Unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(text: &str) -> String {
        URL_SAFE.encode(text.as_bytes())
    }

    #[test]
    fn test_from_api_message_lifts_headers() {
        let api = json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "hello there",
            "labelIds": ["INBOX", "UNREAD"],
            "internalDate": "1700000000000",
            "payload": {
                "headers": [
                    {"name": "From", "value": "alice@example.com"},
                    {"name": "To", "value": "bob@example.com"},
                    {"name": "Subject", "value": "Greetings"}
                ]
            }
        });

        let msg = MailMessage::from_api_message(&api);
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.from_addr.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.subject.as_deref(), Some("Greetings"));
        assert_eq!(msg.internal_date, Some(1_700_000_000_000));
        assert_eq!(
            msg.labels,
            Some(vec!["INBOX".to_string(), "UNREAD".to_string()])
        );
        assert!(!msg.has_attachments);
    }

    #[test]
    fn test_attachment_detection_by_filename() {
        let api = json!({
            "id": "m2",
            "payload": {
                "parts": [
                    {"mimeType": "text/plain", "filename": ""},
                    {"mimeType": "application/pdf", "filename": "invoice.pdf"}
                ]
            }
        });
        let msg = MailMessage::from_api_message(&api);
        assert!(msg.has_attachments);
    }

    #[test]
    fn test_attachment_detection_by_disposition_nested() {
        let payload = json!({
            "parts": [{
                "mimeType": "multipart/mixed",
                "parts": [{
                    "mimeType": "image/png",
                    "filename": "",
                    "headers": [
                        {"name": "Content-Disposition", "value": "attachment; name=x.png"}
                    ]
                }]
            }]
        });
        assert!(part_has_attachments(&payload));
    }

    #[test]
    fn test_body_text_prefers_plain_over_html() {
        let api = json!({
            "id": "m3",
            "snippet": "snippet text",
            "payload": {
                "parts": [
                    {"mimeType": "text/html", "body": {"data": encode("<p>html body</p>")}},
                    {"mimeType": "text/plain", "body": {"data": encode("plain body")}}
                ]
            }
        });
        let msg = MailMessage::from_api_message(&api);
        let body = msg.body_text();
        assert!(body.starts_with("plain body"));
    }

    #[test]
    fn test_body_text_falls_back_to_snippet() {
        let api = json!({"id": "m4", "snippet": "only a snippet"});
        let msg = MailMessage::from_api_message(&api);
        assert_eq!(msg.body_text(), "only a snippet");
    }

    #[test]
    fn test_decode_base64url_fixes_padding() {
        // "hi" encodes to "aGk" without padding
        assert_eq!(decode_base64url("aGk").as_deref(), Some("hi"));
    }

    #[test]
    fn test_format_internal_date() {
        assert_eq!(format_internal_date(None), "Unknown");
        assert_eq!(format_internal_date(Some(0)), "1970-01-01 00:00");
    }
}
