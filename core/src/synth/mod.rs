//! Speech synthesis provider boundary
//!
//! The pipeline only sees [`SpeechSynthesizer`]. The provider gives no latency
//! or rate guarantees; the caller wraps every call in a timeout and the rate
//! limiter.

mod http;

pub use http::{split_chunks, HttpSynthesizer};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("Provider quota exceeded: {0}")]
    Quota(String),

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl SynthesisError {
    /// Classifies a provider message. Quota signals are recognised by content.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if ["quota", "limit", "429"].iter().any(|k| lower.contains(k)) {
            SynthesisError::Quota(message)
        } else {
            SynthesisError::Transient(message)
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, SynthesisError::Quota(_))
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns encoded audio (MP3) for already-sanitized text.
    async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quota_messages() {
        assert!(SynthesisError::from_message("429 Too Many Requests").is_quota());
        assert!(SynthesisError::from_message("Daily Quota exceeded").is_quota());
        assert!(SynthesisError::from_message("rate LIMIT reached").is_quota());
        assert!(!SynthesisError::from_message("connection reset").is_quota());
    }
}
