use std::hash::Hasher;
use std::str::FromStr;
use std::sync::Arc;

use lazy_static::lazy_static;
use ndarray::Array1;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::Deserialize;
use unicode_normalization::UnicodeNormalization;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Which embedder the pipeline builds its index with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum EmbeddingBackend {
    Hashed,
    FastEmbed,
}

impl Default for EmbeddingBackend {
    #[cfg(feature = "fastembed")]
    fn default() -> Self {
        Self::FastEmbed
    }

    #[cfg(not(feature = "fastembed"))]
    fn default() -> Self {
        Self::Hashed
    }
}

impl FromStr for EmbeddingBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(PipelineError::Configuration(format!(
                "unknown embedding backend '{other}'. Expected 'hashed' or 'fastembed'."
            ))),
        }
    }
}

impl TryFrom<String> for EmbeddingBackend {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Builds the embedder named by `config.embedding_backend`.
///
/// The hashed backend uses `embedding_dimension`; a FastEmbed model always
/// reports its own dimension. Loading a FastEmbed model may download it, so
/// call this off the async runtime.
pub fn build_embedder(config: &PipelineConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding_backend {
        EmbeddingBackend::Hashed => Ok(Arc::new(HashedEmbedder::new(config.embedding_dimension))),
        #[cfg(feature = "fastembed")]
        EmbeddingBackend::FastEmbed => Ok(Arc::new(FastEmbedder::new(
            config.embedding_model.as_deref(),
        )?)),
        #[cfg(not(feature = "fastembed"))]
        EmbeddingBackend::FastEmbed => Err(PipelineError::Configuration(
            "embedding backend 'fastembed' requires building with the `fastembed` feature".into(),
        )),
    }
}

/// Maps free text to a fixed-dimension vector.
///
/// An index is only valid for the embedder that built it: `model_id` and
/// `dimension` are persisted alongside the vectors and compared on load.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

lazy_static! {
    static ref STOP_WORDS: FxHashSet<&'static str> = {
        let words = vec![
            "a", "an", "and", "are", "as", "at", "be", "by", "for", "from",
            "has", "he", "in", "is", "it", "its", "of", "on", "that", "the",
            "to", "was", "were", "will", "with"
        ];
        words.into_iter().collect()
    };
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Feature-hashing embedder: tokens land in signed buckets weighted by
/// sublinear term frequency, and the result is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashed-tf-v1-{dimension}"),
        }
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let text = text.nfc().collect::<String>().to_lowercase();
        let text = NON_WORD.replace_all(&text, " ");

        text.split_whitespace()
            .filter(|&token| !STOP_WORDS.contains(token))
            .map(|token| token.to_string())
            .collect()
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let mut hasher = FxHasher::default();
        hasher.write(token.as_bytes());
        let hash = hasher.finish();
        let index = (hash % self.dimension as u64) as usize;
        // Top bit picks the sign so colliding tokens tend to cancel out.
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Embedder for HashedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut term_freq: FxHashMap<String, f32> = FxHashMap::default();
        for token in self.tokenize(text) {
            *term_freq.entry(token).or_insert(0.0) += 1.0;
        }

        let mut vector = Array1::<f32>::zeros(self.dimension);
        for (token, freq) in &term_freq {
            let (index, sign) = self.bucket(token);
            vector[index] += sign * (1.0 + freq.ln());
        }

        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector /= norm;
        }

        Ok(vector.to_vec())
    }
}

#[cfg(feature = "fastembed")]
pub use neural::FastEmbedder;

#[cfg(feature = "fastembed")]
mod neural {
    use std::str::FromStr;
    use std::sync::Mutex;

    use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
    use tracing::info;

    use super::Embedder;
    use crate::error::{PipelineError, Result};

    /// Sentence embeddings from a local ONNX model, `AllMiniLML6V2` unless
    /// another FastEmbed model code is given.
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>,
        model_id: String,
        dimension: usize,
    }

    impl FastEmbedder {
        pub fn new(model_override: Option<&str>) -> Result<Self> {
            let model_name = match model_override {
                Some(code) => EmbeddingModel::from_str(code).map_err(|err| {
                    PipelineError::Configuration(format!("unknown FastEmbed model '{code}': {err}"))
                })?,
                None => EmbeddingModel::AllMiniLML6V2,
            };
            let model_code = model_name.to_string();

            let dimension = EmbeddingModel::get_model_info(&model_name)
                .map(|info| info.dim)
                .ok_or_else(|| {
                    PipelineError::Embedding(format!("FastEmbed model metadata missing for {model_code}"))
                })?;

            let options = TextInitOptions::new(model_name).with_show_download_progress(true);
            let model = TextEmbedding::try_new(options).map_err(|err| {
                PipelineError::Embedding(format!("initialising FastEmbed text model: {err}"))
            })?;

            info!(model = %model_code, dimension, "Loaded FastEmbed model");
            Ok(Self {
                model: Mutex::new(model),
                model_id: format!("fastembed-{model_code}"),
                dimension,
            })
        }
    }

    impl Embedder for FastEmbedder {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.embed_batch(&[text.to_owned()])?
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::Embedding("fastembed returned no embedding for input".into()))
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| PipelineError::Embedding("FastEmbed model lock poisoned".into()))?;
            let embeddings = model
                .embed(texts.to_vec(), None)
                .map_err(|err| PipelineError::Embedding(format!("generating fastembed vectors: {err}")))?;

            if embeddings.len() != texts.len() {
                return Err(PipelineError::Embedding(format!(
                    "fastembed returned {} vectors for {} inputs",
                    embeddings.len(),
                    texts.len()
                )));
            }
            Ok(embeddings)
        }
    }
}

/// Cosine similarity, zero when either side has no magnitude or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let a = ndarray::ArrayView1::from(a);
    let b = ndarray::ArrayView1::from(b);
    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_has_fixed_dimension() -> Result<()> {
        let embedder = HashedEmbedder::new(64);
        assert_eq!(embedder.embed("struggling to sleep well")?.len(), 64);
        assert_eq!(embedder.embed("")?.len(), 64);
        assert_eq!(embedder.model_id(), "hashed-tf-v1-64");
        Ok(())
    }

    #[test]
    fn test_embedding_is_deterministic_and_normalised() -> Result<()> {
        let embedder = HashedEmbedder::new(128);
        let first = embedder.embed("Feeling anxious before exams")?;
        let second = embedder.embed("Feeling anxious before exams")?;
        assert_eq!(first, second);

        let norm: f32 = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_tokenize_drops_punctuation_and_stop_words() {
        let embedder = HashedEmbedder::new(8);
        let tokens = embedder.tokenize("The exam is TOMORROW!");
        assert_eq!(tokens, vec!["exam".to_string(), "tomorrow".to_string()]);
    }

    #[test]
    fn test_shared_terms_score_higher() -> Result<()> {
        let embedder = HashedEmbedder::new(384);
        let query = embedder.embed("trouble sleeping at night")?;
        let related = embedder.embed("sleeping badly at night")?;
        let unrelated = embedder.embed("quarterly revenue report")?;
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
        Ok(())
    }

    #[test]
    fn test_cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_of_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
    }

    #[test]
    fn test_embedding_backend_from_str() {
        assert_eq!("hashed".parse::<EmbeddingBackend>().ok(), Some(EmbeddingBackend::Hashed));
        assert_eq!("FastEmbed".parse::<EmbeddingBackend>().ok(), Some(EmbeddingBackend::FastEmbed));
        assert_eq!("fast-embed".parse::<EmbeddingBackend>().ok(), Some(EmbeddingBackend::FastEmbed));
        assert!(matches!(
            "openai".parse::<EmbeddingBackend>(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_build_hashed_embedder_from_config() -> Result<()> {
        let config = PipelineConfig {
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimension: 32,
            ..PipelineConfig::default()
        };
        let embedder = build_embedder(&config)?;
        assert_eq!(embedder.model_id(), "hashed-tf-v1-32");
        assert_eq!(embedder.dimension(), 32);
        Ok(())
    }

    #[cfg(not(feature = "fastembed"))]
    #[test]
    fn test_fastembed_backend_needs_feature() {
        let config = PipelineConfig {
            embedding_backend: EmbeddingBackend::FastEmbed,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            build_embedder(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[cfg(feature = "fastembed")]
    #[test]
    fn test_unknown_fastembed_model_is_a_configuration_error() {
        assert!(matches!(
            FastEmbedder::new(Some("no-such-model")),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[cfg(feature = "fastembed")]
    #[test]
    #[ignore = "downloads the AllMiniLML6V2 model"]
    fn test_fastembed_default_model() -> Result<()> {
        let embedder = FastEmbedder::new(None)?;
        assert_eq!(embedder.dimension(), 384);
        assert!(embedder.model_id().starts_with("fastembed-"));
        assert_eq!(embedder.embed("trouble sleeping at night")?.len(), 384);
        Ok(())
    }
}
