//! Image-comparison oracle interface and its failure model.

use crate::quest::ComparisonResult;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// An image in the transport form handed to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Encoded bytes (bounded dimensions, quality-compressed)
    Inline { data: Arc<[u8]>, mime_type: String },

    /// A URL the oracle fetches itself
    Remote { url: String },
}

impl ImagePayload {
    pub fn inline(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Inline {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote { url: url.into() }
    }

    /// Bytes this payload contributes to an oracle request.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Inline { data, .. } => data.len(),
            Self::Remote { url } => url.len(),
        }
    }
}

/// Oracle failures, classified by how the caller should react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Oracle error: {0}")]
    Unknown(String),

    #[error("Payload of {bytes} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { bytes: usize, limit: usize },

    #[error("Image encoding failed: {0}")]
    Encoding(String),
}

/// How a failure is handled by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Never retried
    Fatal,

    /// Retried after a long backoff
    RateLimited,

    /// Retried after the standard exponential backoff
    Transient,
}

impl OracleError {
    /// Classifies an HTTP status from a remote oracle.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::BadRequest(message),
            404 => Self::NotFound(message),
            429 => Self::RateLimited(message),
            500..=599 => Self::Server(message),
            _ => Self::Unknown(message),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::BadRequest(_)
            | Self::NotFound(_)
            | Self::PayloadTooLarge { .. }
            | Self::Encoding(_) => FailureClass::Fatal,
            Self::RateLimited(_) => FailureClass::RateLimited,
            Self::Server(_) | Self::Unknown(_) => FailureClass::Transient,
        }
    }
}

/// The external image-comparison capability, consumed as a black box.
#[async_trait]
pub trait ImageOracle: Send + Sync {
    async fn compare(
        &self,
        user_image: &ImagePayload,
        reference_image: &ImagePayload,
        description: &str,
    ) -> Result<ComparisonResult, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(OracleError::from_status(400, "x").class(), FailureClass::Fatal);
        assert_eq!(OracleError::from_status(404, "x").class(), FailureClass::Fatal);
        assert_eq!(OracleError::from_status(429, "x").class(), FailureClass::RateLimited);
        assert_eq!(OracleError::from_status(503, "x").class(), FailureClass::Transient);
        assert_eq!(OracleError::from_status(418, "x"), OracleError::Unknown("x".into()));
        assert_eq!(OracleError::from_status(418, "x").class(), FailureClass::Transient);
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(ImagePayload::inline(vec![0; 1024], "image/jpeg").size_bytes(), 1024);
        assert_eq!(ImagePayload::remote("https://a.b/c").size_bytes(), 13);
    }
}
