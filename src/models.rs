//! Model Catalog
//!
//! Descriptors for selectable Venice models: capability metadata,
//! context-window sizes, and the built-in defaults used before the
//! user picks anything. The live list comes from the `/models`
//! endpoint (see `venice.rs`); this module only defines the shapes
//! and the per-class defaults.

use serde::{Deserialize, Serialize};

/// Model type as reported by the Venice API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Text,
    Image,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Text => "text",
            ModelType::Image => "image",
        }
    }
}

/// The three independent model slots a session tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Text,
    Code,
    Image,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Text => "text",
            ModelClass::Code => "code",
            ModelClass::Image => "image",
        }
    }

    /// Parse a `/config` subcommand value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ModelClass::Text),
            "code" => Some(ModelClass::Code),
            "image" => Some(ModelClass::Image),
            _ => None,
        }
    }

    /// The API-side model type backing this class. Code models are
    /// text models flagged `optimized_for_code`.
    pub fn api_type(&self) -> ModelType {
        match self {
            ModelClass::Image => ModelType::Image,
            _ => ModelType::Text,
        }
    }
}

/// Capability flags from the Venice model spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelCapabilities {
    pub optimized_for_code: bool,
    pub supports_function_calling: bool,
    pub supports_reasoning: bool,
    pub supports_vision: bool,
    pub supports_web_search: bool,
}

/// Model spec block (context window + capabilities)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSpec {
    pub available_context_tokens: Option<u32>,
    pub capabilities: ModelCapabilities,
}

/// A selectable model, immutable once fetched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub model_spec: ModelSpec,
}

impl ModelRef {
    pub fn context_window(&self) -> Option<u32> {
        self.model_spec.available_context_tokens
    }

    pub fn supports_vision(&self) -> bool {
        self.model_spec.capabilities.supports_vision
    }

    /// Short label for inline-keyboard buttons, e.g.
    /// "llama-4-maverick-17b 256K - Vision - Web search"
    pub fn button_label(&self) -> String {
        let mut label = self.id.clone();
        if let Some(tokens) = self.context_window() {
            label.push_str(&format!(" {}", format_context_tokens(tokens)));
        }
        let caps = &self.model_spec.capabilities;
        if caps.supports_vision {
            label.push_str(" - Vision");
        }
        if caps.supports_web_search {
            label.push_str(" - Web search");
        }
        if caps.supports_reasoning {
            label.push_str(" - Reasoning");
        }
        if caps.optimized_for_code {
            label.push_str(" - Code");
        }
        label
    }
}

/// Format a context window size the way model vendors do (262144 -> "256K")
fn format_context_tokens(tokens: u32) -> String {
    if tokens >= 1024 {
        format!("{}K", tokens / 1024)
    } else {
        tokens.to_string()
    }
}

/// Default text model: Venice Large
pub fn default_text_model() -> ModelRef {
    ModelRef {
        id: "llama-4-maverick-17b".to_string(),
        model_type: ModelType::Text,
        model_spec: ModelSpec {
            available_context_tokens: Some(262_144),
            capabilities: ModelCapabilities {
                optimized_for_code: false,
                supports_function_calling: true,
                supports_reasoning: false,
                supports_vision: true,
                supports_web_search: true,
            },
        },
    }
}

/// Default coding model
pub fn default_code_model() -> ModelRef {
    ModelRef {
        id: "deepseek-coder-v2-lite".to_string(),
        model_type: ModelType::Text,
        model_spec: ModelSpec {
            available_context_tokens: Some(131_072),
            capabilities: ModelCapabilities {
                optimized_for_code: true,
                supports_function_calling: false,
                supports_reasoning: false,
                supports_vision: false,
                supports_web_search: false,
            },
        },
    }
}

/// Default image model. Image models carry no spec block.
pub fn default_image_model() -> ModelRef {
    ModelRef {
        id: "venice-sd35".to_string(),
        model_type: ModelType::Image,
        model_spec: ModelSpec::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_label_full() {
        let model = default_text_model();
        let label = model.button_label();
        assert!(label.contains("llama-4-maverick-17b"));
        assert!(label.contains("256K"));
        assert!(label.contains("Vision"));
        assert!(label.contains("Web search"));
        assert!(!label.contains("Reasoning"));
    }

    #[test]
    fn test_button_label_bare() {
        let model = default_image_model();
        assert_eq!(model.button_label(), "venice-sd35");
    }

    #[test]
    fn test_model_class_api_type() {
        assert_eq!(ModelClass::Text.api_type(), ModelType::Text);
        assert_eq!(ModelClass::Code.api_type(), ModelType::Text);
        assert_eq!(ModelClass::Image.api_type(), ModelType::Image);
    }

    #[test]
    fn test_model_class_parse() {
        assert_eq!(ModelClass::parse("code"), Some(ModelClass::Code));
        assert_eq!(ModelClass::parse("bogus"), None);
    }

    #[test]
    fn test_model_ref_deserializes_api_shape() {
        let json = r#"{
            "id": "mistral-31-24b",
            "type": "text",
            "object": "model",
            "owned_by": "venice.ai",
            "model_spec": {
                "availableContextTokens": 131072,
                "capabilities": {
                    "supportsVision": true,
                    "supportsWebSearch": true
                }
            }
        }"#;
        let model: ModelRef = serde_json::from_str(json).unwrap();
        assert_eq!(model.id, "mistral-31-24b");
        assert_eq!(model.context_window(), Some(131072));
        assert!(model.supports_vision());
        assert!(!model.model_spec.capabilities.supports_reasoning);
    }
}
