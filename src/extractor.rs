//! Receipt extraction client.
//!
//! Wraps the remote vision call behind the [`ReceiptExtractor`] trait so the
//! orchestrator can run against a stub in tests, and owns everything between
//! the model's raw text and a candidate [`ExtractionResult`]: code-fence
//! stripping, the no-receipt sentinel, and JSON shape parsing. No semantic
//! repair is attempted beyond fence stripping.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::openrouter::OpenRouterClient;
use crate::schema::ExtractionResult;

/// Instructional prompt sent with every receipt image. The sentinel phrase in
/// the last line is what [`parse_response`] recognizes as the no-receipt
/// outcome.
pub const RECEIPT_PROMPT: &str = r#"The image contains a retail receipt. Output the receipt contents as a single JSON object:

{
    "store": "store name",
    "genre": "rough spending category (e.g. grocery, convenience, dining, clothing)",
    "datetime": "transaction date and time, ISO 8601",
    "total": tax-inclusive total amount as a number,
    "items": [
        {"name": "item1", "price": 500},
        {"name": "item2", "price": 500}
    ]
}

If the image does not contain a receipt, reply with exactly:
レシートが含まれていません
"#;

/// Sentinel phrases meaning "valid image, but no receipt in it".
const NO_RECEIPT_SENTINELS: &[&str] = &["レシートが含まれていません", "no receipt"];

/// Async seam between the orchestrator and the remote vision model.
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    /// Produce a candidate record from normalized image bytes.
    async fn extract(&self, image_bytes: &[u8]) -> PipelineResult<ExtractionResult>;
}

/// Production extractor backed by the OpenRouter transport.
pub struct VisionExtractor {
    client: OpenRouterClient,
}

impl VisionExtractor {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReceiptExtractor for VisionExtractor {
    async fn extract(&self, image_bytes: &[u8]) -> PipelineResult<ExtractionResult> {
        let raw = self
            .client
            .complete_with_image(RECEIPT_PROMPT, image_bytes)
            .await?;
        debug!("raw model response: {} chars", raw.len());
        parse_response(&raw)
    }
}

/// Reduce raw model text to an [`ExtractionResult`].
///
/// Grammar: optional leading fence line (with or without a language tag),
/// JSON body, optional trailing fence line. A non-JSON body is checked for
/// the no-receipt sentinel before being reported as a protocol violation.
pub fn parse_response(raw: &str) -> PipelineResult<ExtractionResult> {
    let body = strip_code_fence(raw);

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) if value.is_object() => serde_json::from_value(value)
            .map_err(|e| PipelineError::UnparsableResponse(format!("unexpected shape: {e}"))),
        _ => {
            if is_no_receipt(body) {
                Err(PipelineError::NotAReceipt)
            } else {
                Err(PipelineError::UnparsableResponse(snippet(body)))
            }
        }
    }
}

/// Strip a markdown code fence around the body, if present.
///
/// Works line-wise rather than by ordered string trims so that backtick
/// characters inside the JSON body (item names, say) survive intact.
fn strip_code_fence(raw: &str) -> &str {
    let mut body = raw.trim();

    if let Some(rest) = body.strip_prefix("```") {
        // Drop the whole fence line, language tag included.
        body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }

    let trimmed = body.trim_end();
    if let Some(stripped) = trimmed.strip_suffix("```") {
        // Only a fence when it sits alone on the final line.
        let before = stripped.trim_end_matches([' ', '\t']);
        if before.is_empty() || before.ends_with('\n') {
            return before.trim();
        }
    }

    body.trim()
}

fn is_no_receipt(body: &str) -> bool {
    let lowered = body.to_lowercase();
    NO_RECEIPT_SENTINELS
        .iter()
        .any(|s| body.contains(s) || lowered.contains(s))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
