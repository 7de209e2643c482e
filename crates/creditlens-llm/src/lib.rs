//! creditlens-llm: hosted model backends for the CreditLens model pool.
//!
//! Implements `creditlens_pool::ModelFactory` for the three model types the
//! credit report pipeline uses:
//!
//!   text-generation      → Gemini, or any OpenAI-compatible endpoint
//!   document-extraction  → Cloud Vision `DOCUMENT_TEXT_DETECTION`
//!   image-analysis       → Cloud Vision `LABEL_DETECTION`

pub mod backend;
pub mod factory;
pub mod vision;

mod http;

pub use backend::{AiClient, GeminiClient, LlmError, LlmRequest, LlmResponse, Message, OpenAiCompatibleClient};
pub use factory::{BackendFactory, ClientHandle, Credentials, ModelKind};
pub use vision::{ImageLabel, VisionClient};
