//! Ollama chat API client.

use super::client::{classify_status, classify_transport, retry_after_header, ModelClient, ModelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message in the chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Client for a local or remote Ollama server.
pub struct OllamaClient {
    base_url: String,
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        temperature: f32,
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ModelError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            temperature,
            max_tokens,
            timeout,
            http_client,
        })
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate(&self, prompt: &str, model_id: &str) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.base_url);

        let request = OllamaChatRequest {
            model: model_id,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        debug!(model = model_id, prompt_chars = prompt.len(), "Sending Ollama chat request");

        let response = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e, &self.base_url, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body, retry_after));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        Ok(chat_response.message.content)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = OllamaChatRequest {
            model: "llama3.2:latest",
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: false,
            options: OllamaOptions {
                temperature: 0.7,
                num_predict: None,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.2:latest");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["options"].get("num_predict").is_none());
    }

    #[test]
    fn test_response_parse() {
        let body = r#"{"model":"m","message":{"role":"assistant","content":"{\"a\":1}"},"done":true}"#;
        let parsed: OllamaChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.message.content, r#"{"a":1}"#);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client =
            OllamaClient::new("http://localhost:11434/", 0.1, None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.name(), "ollama");
    }
}
