use super::{BackendError, GenerateOptions, ModelBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Client for interacting with Ollama API
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: &'a GenerateOptions,
}

/// One line of a streamed `/api/generate` response
#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Model {
    name: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<Model>,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if Ollama is available
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        self.client.get(&url).send().await.is_ok()
    }
}

/// Concatenate the `response` fragments of a newline-delimited stream body.
fn collect_stream(body: &str) -> Result<String, BackendError> {
    let mut result = String::new();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let chunk: GenerateChunk =
            serde_json::from_str(line).map_err(|e| BackendError::Decode(e.to_string()))?;
        if let Some(error) = chunk.error {
            return Err(BackendError::Api {
                status: 200,
                body: error,
            });
        }
        result.push_str(&chunk.response);
    }

    Ok(result)
}

#[async_trait]
impl ModelBackend for OllamaClient {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let result: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        Ok(result.models.into_iter().map(|m| m.name).collect())
    }

    /// Generate a streamed response from Ollama and drain it into one string
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model,
            prompt,
            stream: true,
            options,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let text = collect_stream(&body)?;
        tracing::debug!("Raw response from {}: {} bytes", model, text.len());

        if text.trim().is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/");
        assert_eq!(client.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_collect_stream_concatenates_fragments() {
        let body = concat!(
            "{\"model\":\"m\",\"response\":\"#include\",\"done\":false}\n",
            "{\"model\":\"m\",\"response\":\" <gtest/gtest.h>\",\"done\":false}\n",
            "\n",
            "{\"model\":\"m\",\"response\":\"\",\"done\":true}\n",
        );
        assert_eq!(collect_stream(body).unwrap(), "#include <gtest/gtest.h>");
    }

    #[test]
    fn test_collect_stream_reports_error_chunk() {
        let body = "{\"error\":\"model 'x' not found\"}\n";
        match collect_stream(body) {
            Err(BackendError::Api { body, .. }) => assert!(body.contains("not found")),
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[test]
    fn test_collect_stream_rejects_garbage() {
        assert!(matches!(
            collect_stream("not json"),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_collect_stream_empty_body() {
        assert_eq!(collect_stream("").unwrap(), "");
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Nothing serves HTTP on the discard port
        let client = OllamaClient::new("http://127.0.0.1:9");
        assert!(!client.is_available().await);
        assert!(matches!(
            client.list_models().await,
            Err(BackendError::Unreachable(_))
        ));
    }
}
