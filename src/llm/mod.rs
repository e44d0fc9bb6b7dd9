//! LLM provider clients and the retrying invocation adapter.

pub mod audit;
pub mod client;
pub mod gemini;
pub mod invoke;
pub mod ollama;

pub use audit::AuditSink;
pub use client::{ModelClient, ModelError};
pub use gemini::{GeminiClient, GEMINI_BASE_URL};
pub use invoke::{InvocationContext, InvocationError, Invoker, RawResponse, RetryPolicy};
pub use ollama::OllamaClient;

use crate::config::{ModelConfig, Provider};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Build the provider client described by the model configuration.
///
/// For Gemini the API key is read from the environment variable named by
/// `api_key_env`; a missing key is a fatal configuration error.
pub fn build_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    let endpoint = config.effective_endpoint();
    let timeout = config.attempt_timeout();

    let client: Arc<dyn ModelClient> = match config.provider {
        Provider::Ollama => Arc::new(OllamaClient::new(
            endpoint,
            config.temperature,
            config.max_tokens,
            timeout,
        )?),
        Provider::Gemini => {
            let api_key = std::env::var(&config.api_key_env).with_context(|| {
                format!("Gemini API key not found in ${}", config.api_key_env)
            })?;
            Arc::new(GeminiClient::new(
                endpoint,
                api_key,
                config.temperature,
                config.max_tokens,
                timeout,
            )?)
        }
    };

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ollama_client() {
        let config = ModelConfig::default();
        let client = build_client(&config).unwrap();
        assert_eq!(client.name(), "ollama");
    }

    #[test]
    fn test_gemini_requires_key() {
        let config = ModelConfig {
            provider: Provider::Gemini,
            api_key_env: "GOVSYNTH_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ModelConfig::default()
        };
        let err = build_client(&config).err().unwrap();
        assert!(err.to_string().contains("GOVSYNTH_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
