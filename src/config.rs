use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::embedder::EmbeddingBackend;

#[derive(Clone, Deserialize, Debug)]
pub struct PipelineConfig {
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub groq_base_url: String,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    #[serde(default = "default_corpus_path")]
    pub corpus_path: PathBuf,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    /// FastEmbed model code; `AllMiniLML6V2` when unset.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Only used by the hashed backend.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
}

impl PipelineConfig {
    /// The API key, treating an empty or blank value as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.groq_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            groq_api_key: None,
            groq_base_url: default_base_url(),
            generation_model: default_generation_model(),
            corpus_path: default_corpus_path(),
            index_path: default_index_path(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: None,
            embedding_dimension: default_embedding_dimension(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            request_timeout_secs: default_request_timeout_secs(),
            chunk_max_chars: default_chunk_max_chars(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_generation_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

fn default_corpus_path() -> PathBuf {
    PathBuf::from("./data/combined_dataset.json")
}

fn default_index_path() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("sunny-rag").join("index.json"))
        .unwrap_or_else(|| PathBuf::from("./data/index.json"))
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_top_k() -> usize {
    3
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_chunk_max_chars() -> usize {
    1000
}

pub fn get_config() -> Result<PipelineConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().try_parsing(true))
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.top_k, 3);
        assert_eq!(config.embedding_dimension, 384);
        assert_eq!(config.generation_model, "llama-3.1-8b-instant");
        assert!(config.api_key().is_none());
    }

    #[test]
    fn test_blank_api_key_counts_as_missing() {
        let mut config = PipelineConfig {
            groq_api_key: Some("   ".into()),
            ..PipelineConfig::default()
        };
        assert!(config.api_key().is_none());

        config.groq_api_key = Some("gsk_test".into());
        assert_eq!(config.api_key(), Some("gsk_test"));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: PipelineConfig = Config::builder()
            .set_override("top_k", 5)
            .and_then(|builder| builder.set_override("corpus_path", "corpus.json"))
            .and_then(|builder| builder.build())
            .and_then(|config| config.try_deserialize())
            .expect("config should deserialize");

        assert_eq!(config.top_k, 5);
        assert_eq!(config.corpus_path, PathBuf::from("corpus.json"));
        assert_eq!(config.max_tokens, 1000);
        assert_eq!(config.embedding_backend, EmbeddingBackend::default());
    }

    #[test]
    fn test_deserialize_embedding_backend() {
        let config: PipelineConfig = Config::builder()
            .set_override("embedding_backend", "hashed")
            .and_then(|builder| builder.build())
            .and_then(|config| config.try_deserialize())
            .expect("config should deserialize");
        assert_eq!(config.embedding_backend, EmbeddingBackend::Hashed);

        let rejected = Config::builder()
            .set_override("embedding_backend", "word2vec")
            .and_then(|builder| builder.build())
            .and_then(|config| config.try_deserialize::<PipelineConfig>());
        assert!(rejected.is_err());
    }
}
