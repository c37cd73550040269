//! HTTP speech synthesizer
//!
//! Talks to the Google Translate TTS endpoint (the same backend the gTTS
//! library uses). The endpoint rejects long inputs, so text is split on word
//! boundaries into chunks of at most `max_chunk_chars` characters and the
//! returned MP3 streams are concatenated in order.

use super::{SpeechSynthesizer, SynthesisError};
use crate::config::SynthConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpSynthesizer {
    config: SynthConfig,
    http_client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(config: SynthConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    async fn fetch_chunk(
        &self,
        chunk: &str,
        language: &str,
        idx: usize,
        total: usize,
    ) -> Result<Vec<u8>, SynthesisError> {
        let idx_s = idx.to_string();
        let total_s = total.to_string();
        let len_s = chunk.chars().count().to_string();

        let response = self
            .http_client
            .get(&self.config.endpoint)
            .query(&[
                ("ie", "UTF-8"),
                ("q", chunk),
                ("tl", language),
                ("total", total_s.as_str()),
                ("idx", idx_s.as_str()),
                ("textlen", len_s.as_str()),
                ("client", "tw-ob"),
                ("ttsspeed", "1"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SynthesisError::Timeout(Duration::from_millis(self.config.timeout_ms))
                } else {
                    SynthesisError::from_message(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(target: "synth", language = %language, "Provider answered 429");
            return Err(SynthesisError::Quota(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(SynthesisError::from_message(format!(
                "HTTP {status}: {snippet}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Transient(format!("reading body: {e}")))?;
        if bytes.is_empty() {
            return Err(SynthesisError::Transient("empty audio body".into()));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
        let chunks = split_chunks(text, self.config.max_chunk_chars);
        if chunks.is_empty() {
            return Err(SynthesisError::Transient("nothing to synthesize".into()));
        }
        debug!(target: "synth", language = %language, chunks = chunks.len(), "Synthesizing");

        let mut audio = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let part = self.fetch_chunk(chunk, language, idx, chunks.len()).await?;
            audio.extend_from_slice(&part);
        }
        Ok(audio)
    }
}

/// Greedy word-boundary split; words longer than `max_chars` are cut at char boundaries.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        let needed = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
