//! Inference adapter for the local text-generation engine.
//!
//! The engine is treated as an opaque, non-deterministic function from prompt
//! to text. Agents only see the [`InferenceEngine`] trait; [`LocalEngineClient`]
//! is the production implementation.

mod error;
mod local;

pub use local::LocalEngineClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Optional sampling parameters for a generation request.
///
/// These are intentionally conservative; the goal is reproducibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature (0 = deterministic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum output tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none", rename = "num_predict")]
    pub max_tokens: Option<u64>,
}

/// Text produced by one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: Option<String>,
    /// Wall-clock time the engine reported for the call, if any
    pub duration_ms: Option<u64>,
}

/// Trait for inference engines: prompt in, text out.
///
/// Implementations may be slow (seconds) and must not hold locks shared with
/// other agents while waiting. Callers bound the call with their own timeout.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions)
        -> anyhow::Result<Generation>;
}
