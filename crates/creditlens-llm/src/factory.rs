//! `ModelFactory` implementation that builds real backend clients.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use creditlens_pool::{FactoryRegistry, ModelConfig, ModelError, ModelFactory};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{AiClient, GeminiClient, LlmError, OpenAiCompatibleClient};
use crate::vision::VisionClient;

/// What the pool hands out for every model type this crate serves.
pub type ClientHandle = Arc<dyn AiClient>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 2;

pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_OPENAI_COMPATIBLE: &str = "openai_compatible";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    TextGeneration,
    DocumentExtraction,
    ImageAnalysis,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::TextGeneration,
        ModelKind::DocumentExtraction,
        ModelKind::ImageAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::TextGeneration => "text-generation",
            ModelKind::DocumentExtraction => "document-extraction",
            ModelKind::ImageAnalysis => "image-analysis",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text-generation" => Ok(ModelKind::TextGeneration),
            "document-extraction" => Ok(ModelKind::DocumentExtraction),
            "image-analysis" => Ok(ModelKind::ImageAnalysis),
            other => Err(LlmError::InvalidConfig(format!("unknown model type '{other}'"))),
        }
    }
}

/// API keys for the hosted backends. Never logged.
#[derive(Debug, Default)]
pub struct Credentials {
    pub gemini_api_key: Option<SecretString>,
    /// Falls back to the Gemini key; both are Google Cloud API keys.
    pub vision_api_key: Option<SecretString>,
    pub compat_api_key: Option<SecretString>,
}

impl Credentials {
    /// Read `GEMINI_API_KEY`, `GOOGLE_VISION_API_KEY` and `CREDITLENS_COMPAT_API_KEY`.
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: env_secret("GEMINI_API_KEY"),
            vision_api_key: env_secret("GOOGLE_VISION_API_KEY"),
            compat_api_key: env_secret("CREDITLENS_COMPAT_API_KEY"),
        }
    }

    fn gemini(&self) -> Result<SecretString, LlmError> {
        self.gemini_api_key
            .as_ref()
            .map(duplicate)
            .ok_or(LlmError::MissingCredentials("GEMINI_API_KEY"))
    }

    fn vision(&self) -> Result<SecretString, LlmError> {
        self.vision_api_key
            .as_ref()
            .or(self.gemini_api_key.as_ref())
            .map(duplicate)
            .ok_or(LlmError::MissingCredentials("GOOGLE_VISION_API_KEY"))
    }
}

fn env_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

impl From<LlmError> for ModelError {
    fn from(err: LlmError) -> Self {
        match &err {
            LlmError::MissingCredentials(_)
            | LlmError::InvalidConfig(_)
            | LlmError::Unsupported { .. } => ModelError::Misconfigured(err.to_string()),
            LlmError::ApiError { status: 401 | 403 | 404, .. } => ModelError::Misconfigured(err.to_string()),
            LlmError::ApiError { status, .. } if *status >= 500 => ModelError::Unavailable(err.to_string()),
            LlmError::Http(_) | LlmError::Unavailable(_) | LlmError::RateLimitExceeded => {
                ModelError::Unavailable(err.to_string())
            }
            LlmError::ApiError { .. } | LlmError::Serde(_) | LlmError::ContentBlocked(_) => {
                ModelError::Backend(err.to_string())
            }
        }
    }
}

/// Builds Gemini, Cloud Vision and OpenAI-compatible clients from a
/// [`ModelConfig`].
///
/// Recognised config options: `provider` (`gemini` or `openai_compatible`,
/// text generation only) and `base_url` (required for `openai_compatible`,
/// otherwise overrides the Google endpoint).
#[derive(Debug, Default)]
pub struct BackendFactory {
    credentials: Credentials,
}

impl BackendFactory {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Registry serving every [`ModelKind`] from this factory.
    pub fn registry(self) -> FactoryRegistry<ClientHandle> {
        let factory: Arc<dyn ModelFactory<ClientHandle>> = Arc::new(self);
        ModelKind::ALL
            .iter()
            .fold(FactoryRegistry::new(), |registry, kind| {
                registry.register(kind.as_str(), factory.clone())
            })
    }

    pub fn build(&self, kind: ModelKind, config: &ModelConfig) -> Result<ClientHandle, LlmError> {
        let timeout = config.timeout().unwrap_or(DEFAULT_TIMEOUT);
        let retries = config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let base_url = config.option_str("base_url");

        let client: ClientHandle = match kind {
            ModelKind::TextGeneration => {
                match config.option_str("provider").unwrap_or(PROVIDER_GEMINI) {
                    PROVIDER_GEMINI => {
                        let mut client = GeminiClient::new(self.credentials.gemini()?, &config.model, timeout, retries)?;
                        if let Some(url) = base_url {
                            client = client.with_base_url(url);
                        }
                        Arc::new(client)
                    }
                    PROVIDER_OPENAI_COMPATIBLE => {
                        let url = base_url.ok_or_else(|| {
                            LlmError::InvalidConfig("openai_compatible requires base_url".to_string())
                        })?;
                        if config.model.is_empty() {
                            return Err(LlmError::InvalidConfig(
                                "openai_compatible requires a model name".to_string(),
                            ));
                        }
                        let key = self.credentials.compat_api_key.as_ref().map(duplicate);
                        Arc::new(OpenAiCompatibleClient::new(url, &config.model, key, timeout, retries)?)
                    }
                    other => {
                        return Err(LlmError::InvalidConfig(format!("unknown provider '{other}'")));
                    }
                }
            }
            ModelKind::DocumentExtraction | ModelKind::ImageAnalysis => {
                let mut client = VisionClient::new(kind, self.credentials.vision()?, &config.model, timeout, retries)?;
                if let Some(url) = base_url {
                    client = client.with_base_url(url);
                }
                Arc::new(client)
            }
        };

        debug!(
            model_type = %kind,
            model = client.model_id(),
            timeout_ms = timeout.as_millis() as u64,
            max_retries = retries,
            "Built backend client"
        );
        Ok(client)
    }
}

#[async_trait]
impl ModelFactory<ClientHandle> for BackendFactory {
    async fn create(&self, model_type: &str, config: &ModelConfig) -> Result<ClientHandle, ModelError> {
        let kind = ModelKind::from_str(model_type)?;
        Ok(self.build(kind, config)?)
    }

    async fn probe(&self, handle: &ClientHandle) -> Result<(), ModelError> {
        Ok(handle.ping().await?)
    }
}
