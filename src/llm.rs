use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Anything that turns a prompt into generated text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct LLMConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
}

impl LLMConfig {
    /// Fails when no API key is configured.
    pub fn from_pipeline_config(config: &PipelineConfig) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            PipelineError::Configuration(
                "GROQ_API_KEY missing. Set it in the environment or config file".into(),
            )
        })?;

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: config.groq_base_url.trim_end_matches('/').to_string(),
            model: config.generation_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Hosted chat-completions backend (Groq or any OpenAI-compatible endpoint).
pub struct GroqBackend {
    client: reqwest::Client,
    config: LLMConfig,
}

impl GroqBackend {
    pub fn new(config: LLMConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Configuration("API key is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("building HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(LLMConfig::from_pipeline_config(config)?)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }
}

fn classify_transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_connect() || err.is_timeout() {
        PipelineError::BackendUnavailable(err.to_string())
    } else {
        PipelineError::BackendRequest(err.to_string())
    }
}

#[async_trait]
impl GenerationBackend for GroqBackend {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::BackendRequest(format!(
                "backend returned {status}: {body}"
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::BackendRequest(format!("decoding response: {e}")))?;

        let reply = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::BackendRequest("response contained no choices".into()))?;

        debug!(chars = reply.len(), "Generated reply");
        Ok(reply.trim().to_string())
    }
}
