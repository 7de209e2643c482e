//! Google Cloud Vision `images:annotate` client.
//!
//! One client type serves both document extraction (`DOCUMENT_TEXT_DETECTION`)
//! and image analysis (`LABEL_DETECTION`); the [`ModelKind`] it was built for
//! decides which of the two it accepts.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::backend::{AiClient, LlmError};
use crate::factory::ModelKind;
use crate::http::{build_client, send_with_retries};

pub const VISION_BASE_URL: &str = "https://vision.googleapis.com";
pub const VISION_MODEL_ID: &str = "cloud-vision";

const MAX_LABELS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabel {
    pub description: String,
    pub score: f32,
}

pub struct VisionClient {
    kind: ModelKind,
    model: String,
    pub base_url: String,
    api_key: SecretString,
    max_retries: u32,
    client: reqwest::Client,
}

impl VisionClient {
    pub fn new(
        kind: ModelKind,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        if kind == ModelKind::TextGeneration {
            return Err(LlmError::InvalidConfig(
                "Cloud Vision cannot serve text-generation".to_string(),
            ));
        }
        let model = model.into();
        Ok(Self {
            kind,
            model: if model.is_empty() { VISION_MODEL_ID.to_string() } else { model },
            base_url: VISION_BASE_URL.to_string(),
            api_key,
            max_retries,
            client: build_client(timeout)?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn annotate(&self, requests: Vec<Value>, max_retries: u32) -> Result<Value, LlmError> {
        let url = format!("{}/v1/images:annotate", self.base_url.trim_end_matches('/'));
        let http = self.client
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&json!({ "requests": requests }));
        send_with_retries(http, max_retries).await
    }
}

fn annotate_request(content: &[u8], feature: Value) -> Value {
    json!({
        "image": { "content": BASE64.encode(content) },
        "features": [feature],
    })
}

/// First per-image response, or the error Vision reported for it.
fn first_response(json: &Value) -> Result<&Value, LlmError> {
    let resp = &json["responses"][0];
    if let Some(message) = resp["error"]["message"].as_str() {
        let status = resp["error"]["code"].as_u64().unwrap_or(400) as u16;
        return Err(LlmError::ApiError { status, message: message.to_string() });
    }
    Ok(resp)
}

pub(crate) fn parse_full_text(json: &Value) -> Result<Option<String>, LlmError> {
    let resp = first_response(json)?;
    Ok(resp["fullTextAnnotation"]["text"].as_str().map(str::to_string))
}

pub(crate) fn parse_labels(json: &Value) -> Result<Vec<ImageLabel>, LlmError> {
    let resp = first_response(json)?;
    let labels = resp["labelAnnotations"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|l| {
                    Some(ImageLabel {
                        description: l["description"].as_str()?.to_string(),
                        score: l["score"].as_f64().unwrap_or(0.0) as f32,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(labels)
}

#[async_trait]
impl AiClient for VisionClient {
    fn model_id(&self) -> &str { &self.model }

    fn kind(&self) -> ModelKind { self.kind }

    async fn ping(&self) -> Result<(), LlmError> {
        // An empty batch is accepted without billing and still checks the key.
        self.annotate(Vec::new(), 0).await?;
        Ok(())
    }

    async fn extract_text(&self, document: &[u8]) -> Result<String, LlmError> {
        if self.kind != ModelKind::DocumentExtraction {
            return Err(self.unsupported("document extraction"));
        }
        let request = annotate_request(document, json!({ "type": "DOCUMENT_TEXT_DETECTION" }));
        let json = self.annotate(vec![request], self.max_retries).await?;
        match parse_full_text(&json)? {
            Some(text) => Ok(text),
            None => {
                warn!(bytes = document.len(), "No full text annotation in Vision response");
                Ok(String::new())
            }
        }
    }

    async fn analyze_image(&self, image: &[u8]) -> Result<Vec<ImageLabel>, LlmError> {
        if self.kind != ModelKind::ImageAnalysis {
            return Err(self.unsupported("image analysis"));
        }
        let request = annotate_request(
            image,
            json!({ "type": "LABEL_DETECTION", "maxResults": MAX_LABELS }),
        );
        let json = self.annotate(vec![request], self.max_retries).await?;
        parse_labels(&json)
    }
}
