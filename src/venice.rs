//! Venice API Client
//!
//! Thin HTTP wrapper over the three Venice.ai endpoints the bot
//! consumes: chat completion, image generation, and model listing.
//! Completion requests always ask for automatic web search; any
//! citations Venice returns come back alongside the content.
//!
//! The client sits behind the `VeniceApi` trait so the command
//! machine and completion flow can be exercised without network
//! access.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::history::{ChatMessage, ChatRole, ContentPart, MessageContent};
use crate::models::{ModelRef, ModelType};

const DEFAULT_BASE_URL: &str = "https://api.venice.ai/api/v1";

/// Venice API errors. Transport failures, non-2xx responses and
/// empty completions must stay distinguishable at the call site.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Venice API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned no content")]
    EmptyResponse,

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// A web-search citation attached to a completion
#[derive(Debug, Clone, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// Chat completion result: verified non-empty content plus citations
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub citations: Vec<Citation>,
}

/// Parameters for `/image/generate` beyond the fixed defaults
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
}

/// Contract between the bot core and the Venice backend
#[async_trait]
pub trait VeniceApi: Send + Sync {
    /// Run a chat completion. Fails with `ApiError::EmptyResponse`
    /// when the model answers with no content, so callers never
    /// append an unverified assistant turn.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, ApiError>;

    /// Generate one image, returned as raw bytes
    async fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, ApiError>;

    /// List available models of the given type
    async fn list_models(&self, model_type: ModelType) -> Result<Vec<ModelRef>, ApiError>;
}

/// reqwest-backed Venice client
#[derive(Clone)]
pub struct VeniceClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    venice_parameters: Option<VeniceResponseParameters>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct VeniceResponseParameters {
    #[serde(default)]
    web_search_citations: Vec<Citation>,
}

#[derive(Deserialize)]
struct ImageResponse {
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ModelListResponse {
    data: Vec<ModelRef>,
}

impl VeniceClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

/// Serialize a history message into the OpenAI-compatible wire shape
fn wire_message(message: &ChatMessage) -> serde_json::Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => json!(parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::ImageUrl { url } =>
                    json!({ "type": "image_url", "image_url": { "url": url } }),
            })
            .collect::<Vec<_>>()),
    };
    json!({ "role": role, "content": content })
}

#[async_trait]
impl VeniceApi for VeniceClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, ApiError> {
        let body = json!({
            "model": model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "venice_parameters": { "enable_web_search": "auto" },
        });

        debug!("Venice chat completion: model={}, messages={}", model, messages.len());

        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let parsed: CompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ApiError::EmptyResponse)?;

        let citations = parsed
            .venice_parameters
            .unwrap_or_default()
            .web_search_citations;

        debug!("Venice response: {} chars, {} citations", content.len(), citations.len());

        Ok(ChatCompletion { content, citations })
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, ApiError> {
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "format": "webp",
            "width": 1024,
            "height": 1024,
            "embed_exif_metadata": false,
            "hide_watermark": true,
            "safe_mode": false,
        });

        debug!("Venice image generation: model={}", request.model);

        let response = self
            .client
            .post(self.url("/image/generate"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let parsed: ImageResponse = response.json().await?;
        let first = parsed.images.first().ok_or(ApiError::EmptyResponse)?;

        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(first)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn list_models(&self, model_type: ModelType) -> Result<Vec<ModelRef>, ApiError> {
        debug!("Venice model listing: type={}", model_type.as_str());

        let response = self
            .client
            .get(self.url("/models"))
            .query(&[("type", model_type.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let parsed: ModelListResponse = response.json().await?;
        Ok(parsed.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatMessage;

    #[test]
    fn test_wire_message_plain_text() {
        let msg = ChatMessage::user("hello");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hello");
    }

    #[test]
    fn test_wire_message_multi_part() {
        let msg = ChatMessage::user_with_image(Some("caption"), "https://example.com/p.jpg");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "user");
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "https://example.com/p.jpg");
    }

    #[test]
    fn test_completion_response_decodes_citations() {
        let json = r#"{
            "choices": [{ "message": { "content": "an answer" } }],
            "venice_parameters": {
                "web_search_citations": [
                    { "title": "Example", "url": "https://example.com" }
                ]
            }
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("an answer"));
        let citations = parsed.venice_parameters.unwrap().web_search_citations;
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].title, "Example");
    }

    #[test]
    fn test_completion_response_without_citations() {
        let json = r#"{ "choices": [{ "message": { "content": null } }] }"#;
        let parsed: CompletionResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
        assert!(parsed.venice_parameters.is_none());
    }
}
