//! Stable pool keys derived from `(model_type, config)`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ModelConfig;
use crate::error::Result;

/// Identity shared by every entry built from equivalent `(model_type, config)` pairs.
///
/// Rendered as `<model_type>#<16 hex chars of SHA-256 over canonical JSON>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn new(model_type: &str, config: &ModelConfig) -> Result<Self> {
        let model_type = normalize_model_type(model_type);
        let canonical = canonicalize(serde_json::to_value(config)?);

        let mut hasher = Sha256::new();
        hasher.update(model_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        Ok(Self(format!("{}#{}", model_type, &digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The model type part of the key.
    pub fn model_type(&self) -> &str {
        self.0.split('#').next().unwrap_or_default()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Model types are matched case-insensitively and without surrounding whitespace.
pub fn normalize_model_type(model_type: &str) -> String {
    model_type.trim().to_ascii_lowercase()
}

/// Rebuild objects with sorted keys so insertion order never leaks into the hash.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in fields {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_configs_share_a_key() {
        let a = ModelConfig::new("gemini-1.5-flash")
            .with_option("region", "us-central1")
            .with_option("provider", "gemini");
        let b = ModelConfig::new("gemini-1.5-flash")
            .with_option("provider", "gemini")
            .with_option("region", "us-central1");

        let ka = PoolKey::new("text-generation", &a).unwrap();
        let kb = PoolKey::new("  Text-Generation ", &b).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.model_type(), "text-generation");
    }

    #[test]
    fn test_different_configs_differ() {
        let a = ModelConfig::new("gemini-1.5-flash");
        let b = ModelConfig::new("gemini-1.5-pro");
        assert_ne!(
            PoolKey::new("text-generation", &a).unwrap(),
            PoolKey::new("text-generation", &b).unwrap()
        );
    }

    #[test]
    fn test_model_type_is_part_of_identity() {
        let config = ModelConfig::default();
        assert_ne!(
            PoolKey::new("document-extraction", &config).unwrap(),
            PoolKey::new("image-analysis", &config).unwrap()
        );
    }

    #[test]
    fn test_nested_options_are_canonicalized() {
        let a: ModelConfig =
            serde_json::from_str(r#"{"safety":{"harassment":"block","hate":"none"}}"#).unwrap();
        let b: ModelConfig =
            serde_json::from_str(r#"{"safety":{"hate":"none","harassment":"block"}}"#).unwrap();
        assert_eq!(
            PoolKey::new("text-generation", &a).unwrap(),
            PoolKey::new("text-generation", &b).unwrap()
        );
    }

    #[test]
    fn test_key_format() {
        let key = PoolKey::new("image-analysis", &ModelConfig::default()).unwrap();
        let (prefix, digest) = key.as_str().split_once('#').unwrap();
        assert_eq!(prefix, "image-analysis");
        assert_eq!(digest.len(), 16);
    }
}
