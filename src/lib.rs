//! Retrieval-augmented reply generation for supportive-conversation personas.
//!
//! A JSON or plain-text corpus is embedded once into a persisted
//! [`VectorIndex`]. Each turn retrieves the nearest records for the user's
//! message, folds them together with the caller's session parameters into a
//! persona prompt, and hands that prompt to a [`GenerationBackend`].

pub mod config;
pub mod corpus;
pub mod embedder;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod runner;
pub mod vector_db;

pub use config::{PipelineConfig, get_config};
pub use corpus::{CorpusLoader, DocumentRecord};
pub use embedder::{Embedder, EmbeddingBackend, HashedEmbedder, build_embedder};
#[cfg(feature = "fastembed")]
pub use embedder::FastEmbedder;
pub use error::{PipelineError, Result};
pub use llm::{GenerationBackend, GroqBackend, LLMConfig};
pub use pipeline::{BackendBinder, InitStats, Pipeline, PipelineCache};
pub use prompt::{
    CompanionParameters, ContextSource, ConversationContext, Persona, SessionParameters,
    TherapistParameters,
};
pub use retriever::Retriever;
pub use runner::{ConversationRunner, TurnReport, TurnState};
pub use vector_db::{SearchHit, VectorIndex};
