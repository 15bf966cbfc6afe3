//! Pipeline error types.

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur along the ingestion pipeline.
///
/// Only `NoImagesFound` aborts a whole batch; everything else is captured
/// per-image into the batch report and processing continues.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A folder-mode batch found nothing to process.
    #[error("no images found in {0}")]
    NoImagesFound(String),

    /// The image bytes could not be decoded.
    #[error("unreadable image: {0}")]
    UnreadableImage(String),

    /// The remote extraction call errored or timed out.
    #[error("extraction call failed: {0}")]
    ExtractionFailed(String),

    /// The model replied, but the text cannot be reduced to the expected
    /// JSON object shape.
    #[error("unparsable model response: {0}")]
    UnparsableResponse(String),

    /// The model reported that the image contains no receipt. Valid model
    /// behavior on bad input, not a protocol violation.
    #[error("image does not contain a receipt")]
    NotAReceipt,

    /// A required key is absent from the extracted record.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but violates its constraint.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The storage transaction failed and was rolled back.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// A required configuration variable is not set.
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
}

impl PipelineError {
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::PersistenceFailed(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::ExtractionFailed(err.to_string())
    }
}
