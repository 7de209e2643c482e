//! The factory contract implemented once per backend type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::key::normalize_model_type;

/// Failure reported by a factory while building or probing a handle.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend misconfigured: {0}")]
    Misconfigured(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds client handles for one or more model types and checks them cheaply.
///
/// The pool treats both calls as black boxes: only success, failure and the
/// latency it measures itself matter.
#[async_trait]
pub trait ModelFactory<H>: Send + Sync
where
    H: Send + Sync + 'static,
{
    async fn create(&self, model_type: &str, config: &ModelConfig) -> Result<H, ModelError>;

    async fn probe(&self, handle: &H) -> Result<(), ModelError>;
}

/// Maps model types to the factory that serves them.
pub struct FactoryRegistry<H: Send + Sync + 'static> {
    factories: HashMap<String, Arc<dyn ModelFactory<H>>>,
}

impl<H: Send + Sync + 'static> FactoryRegistry<H> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(mut self, model_type: &str, factory: Arc<dyn ModelFactory<H>>) -> Self {
        self.factories.insert(normalize_model_type(model_type), factory);
        self
    }

    pub fn get(&self, model_type: &str) -> Option<Arc<dyn ModelFactory<H>>> {
        self.factories.get(&normalize_model_type(model_type)).cloned()
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.factories.contains_key(&normalize_model_type(model_type))
    }

    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<H: Send + Sync + 'static> Default for FactoryRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Send + Sync + 'static> fmt::Debug for FactoryRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("model_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoFactory;

    #[async_trait]
    impl ModelFactory<String> for EchoFactory {
        async fn create(&self, model_type: &str, config: &ModelConfig) -> Result<String, ModelError> {
            Ok(format!("{}:{}", model_type, config.model))
        }

        async fn probe(&self, _handle: &String) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup_is_normalized() {
        let registry = FactoryRegistry::new()
            .register("Text-Generation", Arc::new(EchoFactory))
            .register("image-analysis", Arc::new(EchoFactory));

        assert!(registry.contains("text-generation"));
        assert!(registry.contains(" IMAGE-ANALYSIS "));
        assert!(!registry.contains("document-extraction"));
        assert_eq!(registry.model_types(), vec!["image-analysis", "text-generation"]);
    }

    #[tokio::test]
    async fn test_registered_factory_is_callable() {
        let registry = FactoryRegistry::new().register("text-generation", Arc::new(EchoFactory));
        let factory = registry.get("text-generation").unwrap();
        let handle = factory
            .create("text-generation", &ModelConfig::new("gemini-1.5-flash"))
            .await
            .unwrap();
        assert_eq!(handle, "text-generation:gemini-1.5-flash");
        assert!(factory.probe(&handle).await.is_ok());
    }
}
