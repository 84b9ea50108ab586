use reqwest::StatusCode;

use crate::ContextError;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The caller's context was cancelled or its deadline passed.
    #[error("context cancelled: {0}")]
    Cancelled(ContextError),
    /// The outbound request could not be built (malformed URL, bad header).
    #[error("error creating request: {0}")]
    RequestConstruction(reqwest::Error),
    /// Network or request execution error from `reqwest`.
    #[error("error executing request: {0}")]
    Transport(reqwest::Error),
    /// A success status arrived but its body could not be read.
    #[error("error reading response body: {0}")]
    BodyRead(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("failed to get metadata from {url}, status code: {status}, response: {body}")]
    UpstreamStatus {
        url: String,
        status: u16,
        body: String,
    },
    /// Every attempt failed with a retryable error.
    #[error("failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<MetadataError>,
    },
    /// Upstream answered but the value did not have the expected shape.
    #[error("malformed metadata response: {0}")]
    MalformedResponse(String),
}

impl MetadataError {
    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetadataError::Transport(_) => true,
            MetadataError::UpstreamStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// The innermost cause, looking through [`MetadataError::ExhaustedRetries`].
    pub fn last_cause(&self) -> &MetadataError {
        match self {
            MetadataError::ExhaustedRetries { source, .. } => source.last_cause(),
            other => other,
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status) || status == StatusCode::TOO_MANY_REQUESTS.as_u16()
}
