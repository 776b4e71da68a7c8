//! Client for a local text-generation engine with automatic retry for transient errors.
//!
//! Speaks the Ollama-compatible `POST {base}/api/generate` endpoint with
//! `stream: false`. The overall time bound is applied by the caller; this
//! client only retries transient failures inside that bound.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{Backoff, EngineError, EngineFailure};
use super::{GenerateOptions, Generation, InferenceEngine};
use crate::config::InferenceConfig;
use crate::util::truncate_with_marker;

/// Local inference engine client.
pub struct LocalEngineClient {
    client: Client,
    base_url: String,
    model: String,
    backoff: Backoff,
}

impl LocalEngineClient {
    /// Create a new client from configuration.
    pub fn new(config: &InferenceConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            backoff: Backoff::new(config.max_retries),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// One POST to the engine.
    async fn post_once(&self, request: &GenerateRequest<'_>) -> Result<Generation, EngineError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::new(EngineFailure::Unreachable, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::new(EngineFailure::Unreachable, e.to_string()))?;
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                &truncate_with_marker(&body, 500),
            ));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body).map_err(|e| {
            EngineError::new(
                EngineFailure::Malformed,
                format!("{} in {}", e, truncate_with_marker(&body, 500)),
            )
        })?;
        if let Some(error) = parsed.error {
            return Err(EngineError::new(EngineFailure::Busy, error));
        }

        Ok(Generation {
            text: parsed.response,
            model: parsed.model,
            duration_ms: parsed.total_duration.map(|ns| ns / 1_000_000),
        })
    }

    async fn post_with_backoff(&self, request: &GenerateRequest<'_>) -> Result<Generation, EngineError> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.post_once(request).await {
                Ok(generation) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Generation succeeded after {} retries ({:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(generation);
                }
                Err(error) => {
                    let Some(delay) = self.backoff.next_delay(&error, attempt) else {
                        return Err(error);
                    };
                    tracing::warn!(
                        "Generation attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl InferenceEngine for LocalEngineClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> anyhow::Result<Generation> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options,
        };
        tracing::debug!(
            "Sending generate request: model={} prompt_chars={}",
            self.model,
            prompt.len()
        );
        Ok(self.post_with_backoff(&request).await?)
    }
}

/// Generate request body.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: &'a GenerateOptions,
}

/// Non-streaming generate response body.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    response: String,
    /// Total duration in nanoseconds
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}
