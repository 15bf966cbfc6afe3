//! OpenRouter chat-completions transport.
//!
//! Thin wire-level client: builds the vision request (prompt + image as a
//! base64 data URL), applies the bearer credential and per-call timeout, and
//! returns the model's raw text. Interpreting that text is the extractor's
//! job, not this module's.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter client for vision chat completions.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// Create a client with the process-wide credential and request timeout.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Replace the credential for this client (front-end override). The
    /// underlying connection pool is shared with the original.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Send one prompt+image completion request and return the raw text.
    ///
    /// No local state is mutated on failure, so callers may retry freely.
    pub async fn complete_with_image(
        &self,
        prompt: &str,
        image_bytes: &[u8],
    ) -> PipelineResult<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user_with_image(prompt, image_bytes)],
            max_tokens: Some(4096),
        };

        debug!("OpenRouter request: model={}", request.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::ExtractionFailed(format!(
                "OpenRouter API error ({status}): {error_text}"
            )));
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ExtractionFailed(format!("malformed API envelope: {e}")))?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                PipelineError::ExtractionFailed("response contained no completion".to_string())
            })?;

        Ok(content)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

impl Message {
    /// User message carrying the instructional prompt plus one image.
    fn user_with_image(text: &str, image_bytes: &[u8]) -> Self {
        let data_url = format!(
            "data:{};base64,{}",
            sniff_mime(image_bytes),
            BASE64.encode(image_bytes)
        );

        Self {
            role: "user",
            content: vec![
                ContentPart::Text {
                    text: text.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ],
        }
    }
}

/// Detect the image mime type from magic bytes. Receipts are almost always
/// phone-camera JPEGs, which is also the fallback.
fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
