//! Uniform capability over the supported LLM providers.
//!
//! One of several backends is selected at construction, explicitly via
//! configuration or auto-detected from available credentials. The core only
//! ever sees `generate` / `classify`; provider-specific request shaping stays
//! in here.

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
    Command,
    Rules,
}

/// Shared sampling configuration. Classification runs cooler and shorter
/// than open-ended generation.
const CLASSIFY_TEMPERATURE: f64 = 0.3;
const CLASSIFY_MAX_TOKENS: u32 = 200;
const GENERATE_TEMPERATURE: f64 = 0.7;
const GENERATE_MAX_TOKENS: u32 = 500;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OLLAMA_FALLBACK_MODEL: &str = "llama3";

pub struct LlmGateway {
    provider: LlmProvider,
    model: String,
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmGateway {
    /// Selects a provider and model, failing fast when nothing is available
    /// and the selection is not `rules`.
    pub async fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::new();
        let provider = Self::detect_provider(&config, &client).await?;
        let model = Self::resolve_model(&config, provider, &client).await;

        info!(provider = %provider, model = %model, "LLM gateway initialized");

        Ok(Self {
            provider,
            model,
            client,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Model identifier persisted on classification records.
    pub fn model_identifier(&self) -> String {
        if self.model.is_empty() {
            self.provider.to_string()
        } else {
            format!("{}:{}", self.provider, self.model)
        }
    }

    async fn detect_provider(config: &LlmConfig, client: &reqwest::Client) -> Result<LlmProvider> {
        let explicit = config.provider.trim().to_lowercase();
        if !explicit.is_empty() {
            return explicit.parse::<LlmProvider>().map_err(|_| {
                Error::ProviderNotConfigured(format!("unknown LLM provider '{}'", explicit))
            });
        }

        if !Self::openai_key(config).expose_secret().is_empty() {
            return Ok(LlmProvider::OpenAi);
        }
        if !Self::anthropic_key(config).expose_secret().is_empty() {
            return Ok(LlmProvider::Anthropic);
        }
        if Self::is_ollama_running(client, &config.ollama_host).await {
            return Ok(LlmProvider::Ollama);
        }
        if !config.command.trim().is_empty() {
            return Ok(LlmProvider::Command);
        }

        Err(Error::ProviderNotConfigured(
            "set MAILMIND__LLM__PROVIDER, provide an OpenAI/Anthropic API key, \
             start an Ollama server, or configure a command (use 'rules' for testing only)"
                .to_string(),
        ))
    }

    fn openai_key(config: &LlmConfig) -> SecretString {
        if !config.openai_api_key.expose_secret().is_empty() {
            return config.openai_api_key.clone();
        }
        SecretString::from(std::env::var("OPENAI_API_KEY").unwrap_or_default())
    }

    fn anthropic_key(config: &LlmConfig) -> SecretString {
        if !config.anthropic_api_key.expose_secret().is_empty() {
            return config.anthropic_api_key.clone();
        }
        SecretString::from(std::env::var("ANTHROPIC_API_KEY").unwrap_or_default())
    }

    async fn is_ollama_running(client: &reqwest::Client, host: &str) -> bool {
        let url = format!("{}/api/tags", host);
        match client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn resolve_model(
        config: &LlmConfig,
        provider: LlmProvider,
        client: &reqwest::Client,
    ) -> String {
        if !config.model.trim().is_empty() {
            return config.model.trim().to_string();
        }

        match provider {
            LlmProvider::OpenAi => "gpt-3.5-turbo".to_string(),
            LlmProvider::Anthropic => "claude-3-haiku-20240307".to_string(),
            LlmProvider::Ollama => Self::best_ollama_model(client, &config.ollama_host).await,
            LlmProvider::Command | LlmProvider::Rules => String::new(),
        }
    }

    /// Auto-selects the largest model the local Ollama server reports.
    async fn best_ollama_model(client: &reqwest::Client, host: &str) -> String {
        let url = format!("{}/api/tags", host);
        let resp = client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        let body: Value = match resp {
            Ok(resp) => match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to parse Ollama model list: {}, using '{}'", e, OLLAMA_FALLBACK_MODEL);
                    return OLLAMA_FALLBACK_MODEL.to_string();
                }
            },
            Err(e) => {
                warn!("Failed to fetch Ollama models: {}, using '{}'", e, OLLAMA_FALLBACK_MODEL);
                return OLLAMA_FALLBACK_MODEL.to_string();
            }
        };

        let best = body
            .get("models")
            .and_then(|m| m.as_array())
            .and_then(|models| {
                models
                    .iter()
                    .max_by_key(|m| m.get("size").and_then(|s| s.as_i64()).unwrap_or(0))
            })
            .and_then(|m| m.get("name").and_then(|n| n.as_str()))
            .map(str::to_string);

        match best {
            Some(name) => {
                info!("Auto-selected Ollama model: {}", name);
                name
            }
            None => {
                warn!("No Ollama models found, using '{}'", OLLAMA_FALLBACK_MODEL);
                OLLAMA_FALLBACK_MODEL.to_string()
            }
        }
    }

    /// Open-ended generation with a generous timeout (local models can take
    /// minutes).
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(provider = %self.provider, model = %self.model, "LLM generate, {} prompt chars", prompt.len());
        let timeout = Duration::from_secs(self.config.generate_timeout_seconds);

        match self.provider {
            LlmProvider::OpenAi => {
                self.openai_chat(None, prompt, GENERATE_TEMPERATURE, GENERATE_MAX_TOKENS, false, timeout)
                    .await
            }
            LlmProvider::Anthropic => {
                self.anthropic_chat(None, prompt, GENERATE_TEMPERATURE, GENERATE_MAX_TOKENS, timeout)
                    .await
            }
            LlmProvider::Ollama => self.ollama_generate(prompt, timeout).await,
            LlmProvider::Rules => {
                Ok("Based on the emails provided, I can help answer your question.".to_string())
            }
            LlmProvider::Command => Err(Error::Llm(
                "command provider supports classification only".to_string(),
            )),
        }
    }

    /// Structured extraction: cooler temperature, short output, JSON format
    /// hint where the backend supports one.
    pub async fn classify(&self, system: &str, user: &str) -> Result<String> {
        debug!(provider = %self.provider, model = %self.model, "LLM classify");
        let timeout = Duration::from_secs(self.config.classify_timeout_seconds);

        match self.provider {
            LlmProvider::OpenAi => {
                self.openai_chat(Some(system), user, CLASSIFY_TEMPERATURE, CLASSIFY_MAX_TOKENS, true, timeout)
                    .await
            }
            LlmProvider::Anthropic => {
                self.anthropic_chat(Some(system), user, CLASSIFY_TEMPERATURE, CLASSIFY_MAX_TOKENS, timeout)
                    .await
            }
            LlmProvider::Ollama => self.ollama_chat(system, user, timeout).await,
            LlmProvider::Rules => Err(Error::Llm(
                "rules provider has no model; callers use the rule-based fallback".to_string(),
            )),
            LlmProvider::Command => Err(Error::Llm(
                "command provider takes subject/body input; use run_command".to_string(),
            )),
        }
    }

    /// Command provider: spawn the configured argv, write `{subject, body}`
    /// JSON to stdin, read the response from stdout.
    pub async fn run_command(&self, subject: &str, body: &str) -> Result<String> {
        use tokio::io::AsyncWriteExt;

        let command = self.config.command.trim();
        if command.is_empty() {
            return Err(Error::ProviderNotConfigured(
                "command provider selected but no command configured".to_string(),
            ));
        }

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::ProviderNotConfigured("empty command".to_string()))?;

        let input = json!({"subject": subject, "body": body}).to_string();

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::Llm(format!("failed to spawn command: {}", e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::Llm(format!("failed to write command input: {}", e)))?;
        }
        drop(child.stdin.take());

        let timeout = Duration::from_secs(self.config.classify_timeout_seconds);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Llm("command timed out".to_string()))?
            .map_err(|e| Error::Llm(format!("command failed: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Llm(format!(
                "command exited with {}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Generates a short chat-session title from the first user message,
    /// bounded to 60 characters. Never fails: rules and errors fall back to a
    /// truncation of the message itself.
    pub async fn generate_chat_title(&self, first_message: &str) -> String {
        let fallback = || {
            let title: String = first_message
                .split_whitespace()
                .take(5)
                .collect::<Vec<_>>()
                .join(" ");
            let title = truncate_title(&title, 50);
            if title.is_empty() {
                "New Chat".to_string()
            } else {
                title
            }
        };

        if matches!(self.provider, LlmProvider::Rules | LlmProvider::Command) {
            return fallback();
        }

        let prompt = format!(
            "Generate a concise 3-7 word title for a conversation that starts with this message. \
             Return only the title, no quotes or punctuation.\n\nMessage: {}",
            first_message
        );

        match self.generate(&prompt).await {
            Ok(title) => {
                let title = title.trim().trim_matches('"').trim_matches('\'').to_string();
                let title = truncate_title(&title, 60);
                if title.is_empty() { fallback() } else { title }
            }
            Err(e) => {
                warn!("Title generation failed: {}", e);
                fallback()
            }
        }
    }

    async fn openai_chat(
        &self,
        system: Option<&str>,
        user: &str,
        temperature: f64,
        max_tokens: u32,
        json_format: bool,
        timeout: Duration,
    ) -> Result<String> {
        let key = Self::openai_key(&self.config);
        if key.expose_secret().is_empty() {
            return Err(Error::ProviderNotConfigured("OPENAI_API_KEY not set".to_string()));
        }

        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": user}));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if json_format {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.config.openai_base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(key.expose_secret())
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("OpenAI request failed: {}", e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("OpenAI response was not JSON: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Llm(format!("OpenAI returned {}: {}", status, body)));
        }

        body.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Llm("OpenAI response missing content".to_string()))
    }

    async fn anthropic_chat(
        &self,
        system: Option<&str>,
        user: &str,
        temperature: f64,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String> {
        let key = Self::anthropic_key(&self.config);
        if key.expose_secret().is_empty() {
            return Err(Error::ProviderNotConfigured("ANTHROPIC_API_KEY not set".to_string()));
        }

        let mut payload = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": user}],
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }

        let url = format!("{}/messages", self.config.anthropic_base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("Anthropic request failed: {}", e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("Anthropic response was not JSON: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Llm(format!("Anthropic returned {}: {}", status, body)));
        }

        body.pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Llm("Anthropic response missing content".to_string()))
    }

    async fn ollama_chat(&self, system: &str, user: &str, timeout: Duration) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "stream": false,
            "format": "json",
            "options": {
                "temperature": CLASSIFY_TEMPERATURE,
                "num_predict": CLASSIFY_MAX_TOKENS,
            },
        });

        let url = format!("{}/api/chat", self.config.ollama_host);
        let body: Value = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("Ollama request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Llm(format!("Ollama response was not JSON: {}", e)))?;

        body.pointer("/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Llm("Ollama response missing content".to_string()))
    }

    async fn ollama_generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": GENERATE_TEMPERATURE,
                "num_predict": GENERATE_MAX_TOKENS,
            },
        });

        let url = format!("{}/api/generate", self.config.ollama_host);
        let body: Value = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("Ollama request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Llm(format!("Ollama response was not JSON: {}", e)))?;

        body.get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Llm("Ollama response missing content".to_string()))
    }
}

fn truncate_title(title: &str, max: usize) -> String {
    if title.chars().count() <= max {
        return title.to_string();
    }
    let truncated: String = title.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", truncated)
}
