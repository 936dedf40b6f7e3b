//! OpenAI-compatible chat, embedding, and moderation client. Retries are
//! limited to rate limits and server errors, on a fixed backoff schedule
//! with a little jitter; everything else surfaces to the caller.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const RETRY_DELAYS_MS: [u64; 3] = [1_000, 10_000, 20_000];
const RETRY_JITTER_MS: u64 = 100;

#[derive(Debug)]
pub enum LlmError {
    /// The API secret is absent; the process cannot start.
    MissingSecret,
    /// Retries exhausted against 429/5xx responses.
    Retriable { status: u16 },
    /// A response the client cannot use; surfaced as an input error.
    Fatal { message: String },
    Http(reqwest::Error),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSecret => write!(
                f,
                "{API_KEY_ENV_VAR} is not set; export it (e.g. \
                 `export {API_KEY_ENV_VAR}=sk-...`) and restart"
            ),
            Self::Retriable { status } => {
                write!(f, "gave up retrying after repeated status {status}")
            }
            Self::Fatal { message } => write!(f, "llm request failed: {message}"),
            Self::Http(err) => write!(f, "llm transport error: {err}"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
}

impl LlmConfig {
    /// Read the secret and optional overrides from the environment. A
    /// missing key is fatal at startup, with the remediation in the error.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var(API_KEY_ENV_VAR)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingSecret)?;
        Ok(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            chat_model: std::env::var("OPENAI_CHAT_MODEL")
                .unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
            embedding_model: std::env::var("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Chat completion with client-side stop words. Streams when asked,
    /// feeding chunks through the stop filter so a stop token split across
    /// chunk boundaries never leaks.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        stop: &[String],
        stream: bool,
    ) -> Result<String, LlmError> {
        if stream {
            return self.chat_streamed(messages, stop).await;
        }

        let body = json!({
            "model": self.config.chat_model,
            "messages": messages,
        });
        let response = self.post_with_backoff("chat/completions", &body).await?;
        let payload: serde_json::Value = response.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| LlmError::Fatal {
                message: "completion missing choices[0].message.content".to_string(),
            })?;

        let mut filter = StopWordFilter::new(stop);
        let mut text = filter.feed(content);
        text.push_str(&filter.finish());
        Ok(text.trim().to_string())
    }

    async fn chat_streamed(
        &self,
        messages: &[ChatMessage],
        stop: &[String],
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.config.chat_model,
            "messages": messages,
            "stream": true,
        });
        let response = self.post_with_backoff("chat/completions", &body).await?;

        let mut filter = StopWordFilter::new(stop);
        let mut text = String::new();
        let mut pending = String::new();
        let mut byte_stream = response.bytes_stream();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            // Server-sent events, one `data:` line per delta.
            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(delta) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(piece) = delta
                    .pointer("/choices/0/delta/content")
                    .and_then(serde_json::Value::as_str)
                {
                    text.push_str(&filter.feed(piece));
                    if filter.stopped() {
                        break 'outer;
                    }
                }
            }
        }

        text.push_str(&filter.finish());
        Ok(text.trim().to_string())
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": texts,
        });
        let response = self.post_with_backoff("embeddings", &body).await?;
        let payload: serde_json::Value = response.json().await?;
        let data = payload
            .get("data")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| LlmError::Fatal {
                message: "embedding response missing data".to_string(),
            })?;

        let mut vectors = Vec::with_capacity(data.len());
        for entry in data {
            let embedding = entry
                .get("embedding")
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| LlmError::Fatal {
                    message: "embedding entry missing vector".to_string(),
                })?;
            vectors.push(
                embedding
                    .iter()
                    .filter_map(serde_json::Value::as_f64)
                    .map(|v| v as f32)
                    .collect(),
            );
        }
        Ok(vectors)
    }

    pub async fn moderate(&self, text: &str) -> Result<bool, LlmError> {
        let body = json!({ "input": text });
        let response = self.post_with_backoff("moderations", &body).await?;
        let payload: serde_json::Value = response.json().await?;
        payload
            .pointer("/results/0/flagged")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| LlmError::Fatal {
                message: "moderation response missing results[0].flagged".to_string(),
            })
    }

    async fn post_with_backoff(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/{endpoint}", self.config.base_url.trim_end_matches('/'));

        let mut attempt = 0_usize;
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await?;

            let status = response.status();
            if status.as_u16() != 429 && !status.is_server_error() {
                return response.error_for_status().map_err(LlmError::Http);
            }

            let Some(&delay) = RETRY_DELAYS_MS.get(attempt) else {
                return Err(LlmError::Retriable {
                    status: status.as_u16(),
                });
            };
            let jitter = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_millis() as u64 % RETRY_JITTER_MS)
                .unwrap_or(0);
            warn!(endpoint, status = status.as_u16(), attempt, "retrying llm call");
            tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
            attempt += 1;
        }
    }
}

/// Truncates a token stream at the first stop word. Text is released only
/// once it can no longer be the beginning of a stop word, so a stop token
/// split across two chunks is still caught.
#[derive(Debug)]
pub struct StopWordFilter {
    stop_words: Vec<String>,
    carry: String,
    stopped: bool,
}

impl StopWordFilter {
    pub fn new(stop_words: &[String]) -> Self {
        Self {
            stop_words: stop_words.to_vec(),
            carry: String::new(),
            stopped: false,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Feed a chunk and get back the text that is safe to release.
    pub fn feed(&mut self, chunk: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.carry.push_str(chunk);

        // A full stop word anywhere in the carry ends the stream.
        let earliest = self
            .stop_words
            .iter()
            .filter_map(|word| self.carry.find(word.as_str()))
            .min();
        if let Some(index) = earliest {
            self.stopped = true;
            let text = self.carry[..index].to_string();
            self.carry.clear();
            return text;
        }

        // Hold back the longest carry suffix that could still grow into a
        // stop word.
        let hold = self
            .stop_words
            .iter()
            .filter_map(|word| {
                (1..word.len().min(self.carry.len() + 1))
                    .rev()
                    .find(|&len| {
                        word.get(..len)
                            .map(|prefix| self.carry.ends_with(prefix))
                            .unwrap_or(false)
                    })
            })
            .max()
            .unwrap_or(0);

        let release = self.carry.len() - hold;
        let text = self.carry[..release].to_string();
        self.carry.drain(..release);
        text
    }

    /// Flush whatever is still held back once the stream ends.
    pub fn finish(mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let mut filter = StopWordFilter::new(&stops(&["<END>"]));
        let mut out = filter.feed("hello ");
        out.push_str(&filter.feed("world"));
        out.push_str(&filter.finish());
        assert_eq!(out, "hello world");
    }

    #[test]
    fn full_stop_word_truncates_the_stream() {
        let mut filter = StopWordFilter::new(&stops(&["<END>"]));
        let out = filter.feed("goodbye<END>ignored tail");
        assert_eq!(out, "goodbye");
        assert!(filter.stopped());
        assert_eq!(filter.feed("more"), "");
    }

    #[test]
    fn stop_word_split_across_chunks_is_caught() {
        let mut filter = StopWordFilter::new(&stops(&["<END>"]));
        let mut out = filter.feed("answer <E");
        assert_eq!(out, "answer ");
        out.push_str(&filter.feed("ND> trailing"));
        assert_eq!(out, "answer ");
        assert!(filter.stopped());
    }

    #[test]
    fn false_prefix_is_released_once_disambiguated() {
        let mut filter = StopWordFilter::new(&stops(&["<END>"]));
        let mut out = filter.feed("tag <EN");
        assert_eq!(out, "tag ");
        out.push_str(&filter.feed("GINE> runs"));
        out.push_str(&filter.finish());
        assert_eq!(out, "tag <ENGINE> runs");
    }

    #[test]
    fn multiple_stop_words_use_the_earliest_match() {
        let mut filter = StopWordFilter::new(&stops(&["STOP", "HALT"]));
        let out = filter.feed("a HALT b STOP c");
        assert_eq!(out, "a ");
    }

    #[test]
    fn finish_flushes_a_held_suffix() {
        let mut filter = StopWordFilter::new(&stops(&["<END>"]));
        let mut out = filter.feed("trailing <");
        assert_eq!(out, "trailing ");
        out.push_str(&filter.finish());
        assert_eq!(out, "trailing <");
    }

    #[test]
    fn missing_secret_error_names_the_variable() {
        let message = LlmError::MissingSecret.to_string();
        assert!(message.contains(API_KEY_ENV_VAR));
        assert!(message.contains("export"));
    }
}
