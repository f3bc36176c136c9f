use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Text-generation collaborator: one prompt in, one generated answer out.
pub trait LlmClient: Send + Sync {
    /// # Errors
    /// Returns an error when the model cannot be reached or its reply is malformed.
    fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Calls a remote function endpoint with `{"prompt": ...}` and reads `{"response": ...}`.
pub struct HttpLlmClient {
    endpoint: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpLlmClient {
    #[must_use]
    pub fn new(endpoint: String, api_key: Option<String>, timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self { endpoint, api_key, agent: builder.build() }
    }
}

impl LlmClient for HttpLlmClient {
    fn generate(&self, prompt: &str) -> Result<String> {
        let mut request = self.agent.post(&self.endpoint);
        if let Some(api_key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {api_key}"));
        }

        let response = request
            .send_json(GenerateRequest { prompt })
            .map_err(|err| anyhow!("llm request to {} failed: {err}", self.endpoint))?;
        let body: GenerateResponse =
            response.into_json().context("llm response is not a {\"response\": string} object")?;
        Ok(body.response)
    }
}

/// Stand-in used when no endpoint is configured; every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredLlm;

impl LlmClient for UnconfiguredLlm {
    fn generate(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("llm endpoint is not configured"))
    }
}
