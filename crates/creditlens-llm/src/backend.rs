//! Client trait and the text-generation backends.
//!
//! Backends:
//!   GeminiClient           - Google Gemini `generateContent` (gemini-1.5-flash, pro, …)
//!   OpenAiCompatibleClient - any OpenAI-compatible endpoint (vLLM, LMStudio,
//!                            TogetherAI, Groq, OpenRouter, …)
//!
//! Document extraction and image analysis live in [`crate::vision`].

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::factory::ModelKind;
use crate::http::{build_client, send_with_retries};
use crate::vision::ImageLabel;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Request blocked by the backend's safety filter: {0}")]
    ContentBlocked(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("API error [{status}]: {message}")]
    ApiError { status: u16, message: String },
    #[error("{model} does not support {operation}")]
    Unsupported { model: String, operation: &'static str },
    #[error("Missing credentials: set {0}")]
    MissingCredentials(&'static str),
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A pooled client for one backend model.
///
/// Each client serves one [`ModelKind`]; operations belonging to another kind
/// return [`LlmError::Unsupported`].
#[async_trait]
pub trait AiClient: Send + Sync {
    fn model_id(&self) -> &str;

    fn kind(&self) -> ModelKind;

    /// Cheapest request that proves the backend is reachable and the credentials work.
    async fn ping(&self) -> Result<(), LlmError>;

    async fn generate(&self, _req: LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(self.unsupported("text generation"))
    }

    /// Full text of a PDF or scanned document.
    async fn extract_text(&self, _document: &[u8]) -> Result<String, LlmError> {
        Err(self.unsupported("document extraction"))
    }

    async fn analyze_image(&self, _image: &[u8]) -> Result<Vec<ImageLabel>, LlmError> {
        Err(self.unsupported("image analysis"))
    }

    fn unsupported(&self, operation: &'static str) -> LlmError {
        LlmError::Unsupported { model: self.model_id().to_string(), operation }
    }
}

// ── Helpers: parse provider responses ────────────────────────────────────────

pub(crate) fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> LlmResponse {
    LlmResponse {
        content: json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: json["model"]
            .as_str()
            .unwrap_or(fallback_model)
            .to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

pub(crate) fn parse_gemini_response(json: &serde_json::Value, model: &str) -> Result<LlmResponse, LlmError> {
    let parts = json["candidates"][0]["content"]["parts"].as_array();
    let Some(parts) = parts else {
        let reason = json["promptFeedback"]["blockReason"]
            .as_str()
            .or_else(|| json["candidates"][0]["finishReason"].as_str())
            .unwrap_or("no candidates returned");
        return Err(LlmError::ContentBlocked(reason.to_string()));
    };

    let content = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    Ok(LlmResponse {
        content,
        model: json["modelVersion"].as_str().unwrap_or(model).to_string(),
        prompt_tokens:     json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    })
}

// ── 1. Google Gemini ──────────────────────────────────────────────────────────

pub struct GeminiClient {
    pub model: String,
    pub base_url: String,
    api_key: SecretString,
    max_retries: u32,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        let model = model.into();
        Ok(Self {
            model: if model.is_empty() { DEFAULT_GEMINI_MODEL.to_string() } else { model },
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            max_retries,
            client: build_client(timeout)?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn model_url(&self) -> String {
        format!("{}/v1beta/models/{}", self.base_url.trim_end_matches('/'), self.model)
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    fn model_id(&self) -> &str { &self.model }

    fn kind(&self) -> ModelKind { ModelKind::TextGeneration }

    async fn ping(&self) -> Result<(), LlmError> {
        let req = self.client
            .get(self.model_url())
            .header("x-goog-api-key", self.api_key.expose_secret());
        // Metadata only; never retried so a dead backend is noticed quickly.
        send_with_retries(req, 0).await?;
        Ok(())
    }

    async fn generate(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        // System message → systemInstruction; assistant → model
        let system_text = req.messages.iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone());

        let contents: Vec<serde_json::Value> = req.messages.iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": m.content }]
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.max_tokens.unwrap_or(4096),
                "temperature":     req.temperature.unwrap_or(0.1),
            }
        });
        if let Some(sys) = system_text {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": sys }]
            });
        }

        let http = self.client
            .post(format!("{}:generateContent", self.model_url()))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body);
        let json = send_with_retries(http, self.max_retries).await?;
        parse_gemini_response(&json, &self.model)
    }
}

// ── 2. OpenAI-Compatible (vLLM, LMStudio, TogetherAI, Groq, OpenRouter, …) ───

pub struct OpenAiCompatibleClient {
    pub base_url: String,
    pub model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            max_retries,
            client: build_client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k.expose_secret()),
            None    => req,
        }
    }
}

#[async_trait]
impl AiClient for OpenAiCompatibleClient {
    fn model_id(&self) -> &str { &self.model }

    fn kind(&self) -> ModelKind { ModelKind::TextGeneration }

    async fn ping(&self) -> Result<(), LlmError> {
        send_with_retries(self.auth(self.client.get(self.url("models"))), 0).await?;
        Ok(())
    }

    async fn generate(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = serde_json::json!({
            "model":       &self.model,
            "messages":    req.messages,
            "max_tokens":  req.max_tokens.unwrap_or(4096),
            "temperature": req.temperature.unwrap_or(0.1),
        });
        let http = self.auth(self.client.post(self.url("chat/completions"))).json(&body);
        let json = send_with_retries(http, self.max_retries).await?;
        Ok(parse_openai_response(&json, &self.model))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
