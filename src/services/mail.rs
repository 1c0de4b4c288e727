//! Mail provider access: paginated inbox listing, message fetch, and the
//! history API for incremental pulls.
//!
//! The trait is the seam the sync controller tests against; the production
//! implementation speaks the Gmail REST API with an OAuth refresh token.

use crate::config::MailConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// One incremental-history pass: newly added message ids plus the cursor to
/// store for the next pull.
#[derive(Debug, Clone, Default)]
pub struct HistoryDelta {
    pub added_ids: Vec<String>,
    pub history_id: Option<String>,
}

#[async_trait]
pub trait MailClient: Send + Sync {
    /// All message ids in the INBOX folder, fully paginated.
    async fn list_inbox_ids(&self) -> Result<Vec<String>>;

    /// Fetches one message in the given format ("full", "metadata", ...).
    async fn fetch_message(&self, message_id: &str, format: &str) -> Result<Value>;

    /// Changes since a stored cursor. Errors when the cursor has expired;
    /// callers fall back to a full listing.
    async fn list_history_since(&self, history_id: &str) -> Result<HistoryDelta>;

    /// The provider's current history cursor.
    async fn current_history_id(&self) -> Result<Option<String>>;
}

/// Gmail REST client. Access tokens are minted from the configured refresh
/// token and cached until shortly before expiry.
pub struct GmailClient {
    config: MailConfig,
    client: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl GmailClient {
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expiry)) = cached.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }

        debug!("refreshing mail provider access token");
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("refresh_token", self.config.refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Mail(format!("token refresh failed: {}", e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Mail(format!("token response was not JSON: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Mail(format!("token endpoint returned {}: {}", status, body)));
        }

        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Mail("token response missing access_token".to_string()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|e| e.as_u64())
            .unwrap_or(3600);

        // Refresh a minute early
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *cached = Some((token.clone(), expiry));
        Ok(token)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| Error::Mail(format!("request failed: {}", e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Mail(format!("response was not JSON: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Mail(format!("provider returned {}: {}", status, body)));
        }
        Ok(body)
    }
}

/// History cursors are returned as strings or numbers depending on endpoint.
fn history_id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl MailClient for GmailClient {
    async fn list_inbox_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/messages?labelIds=INBOX&maxResults=500",
                self.config.api_base_url
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", token));
            }

            let body = self.get_json(&url).await?;

            if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
                for message in messages {
                    if let Some(id) = message.get("id").and_then(|i| i.as_str()) {
                        ids.push(id.to_string());
                    }
                }
            }

            page_token = body
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        debug!("listed {} inbox message ids", ids.len());
        Ok(ids)
    }

    async fn fetch_message(&self, message_id: &str, format: &str) -> Result<Value> {
        let url = format!(
            "{}/users/me/messages/{}?format={}",
            self.config.api_base_url, message_id, format
        );
        self.get_json(&url).await
    }

    async fn list_history_since(&self, history_id: &str) -> Result<HistoryDelta> {
        let mut delta = HistoryDelta::default();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded&maxResults=500",
                self.config.api_base_url, history_id
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", token));
            }

            let body = self.get_json(&url).await?;

            if let Some(cursor) = history_id_string(body.get("historyId")) {
                delta.history_id = Some(cursor);
            }

            if let Some(entries) = body.get("history").and_then(|h| h.as_array()) {
                for entry in entries {
                    let Some(added) = entry.get("messagesAdded").and_then(|a| a.as_array())
                    else {
                        continue;
                    };
                    for item in added {
                        if let Some(id) = item
                            .pointer("/message/id")
                            .and_then(|i| i.as_str())
                        {
                            delta.added_ids.push(id.to_string());
                        }
                    }
                }
            }

            page_token = body
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        debug!(
            "history since {}: {} added messages",
            history_id,
            delta.added_ids.len()
        );
        Ok(delta)
    }

    async fn current_history_id(&self) -> Result<Option<String>> {
        let url = format!("{}/users/me/profile", self.config.api_base_url);
        let body = self.get_json(&url).await?;
        Ok(history_id_string(body.get("historyId")))
    }
}
