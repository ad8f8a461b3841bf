use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::debug;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::vector_db::VectorIndex;

/// Embeds a query and returns the text of its nearest corpus records.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    vector_db: Arc<VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, vector_db: Arc<VectorIndex>) -> Self {
        Retriever {
            embedder,
            vector_db,
        }
    }

    /// Texts of the `top_k` most similar records, best first. `top_k == 0`
    /// yields no hits rather than an error.
    pub fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve_scored(query, top_k)?
            .into_iter()
            .map(|(text, _)| text)
            .collect())
    }

    pub fn retrieve_scored(&self, query: &str, top_k: usize) -> Result<Vec<(String, f32)>> {
        let Some(k) = NonZeroUsize::new(top_k) else {
            return Ok(Vec::new());
        };

        let vector = self.embedder.embed(query)?;
        let hits = self.vector_db.query(&vector, k)?;
        debug!(
            hits = hits.len(),
            top_score = hits.first().map(|hit| hit.score),
            "Retrieved context"
        );

        Ok(hits
            .into_iter()
            .map(|hit| (hit.record.text.clone(), hit.score))
            .collect())
    }

    pub fn index(&self) -> &VectorIndex {
        &self.vector_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::DocumentRecord;
    use crate::embedder::HashedEmbedder;

    fn retriever(texts: &[&str]) -> Result<Retriever> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashedEmbedder::new(256));
        let records = texts
            .iter()
            .enumerate()
            .map(|(i, text)| DocumentRecord::new(*text, i as u64))
            .collect();
        let index = VectorIndex::build(records, embedder.as_ref())?;
        Ok(Retriever::new(embedder, Arc::new(index)))
    }

    #[test]
    fn test_retrieve_returns_texts_in_similarity_order() -> Result<()> {
        let retriever = retriever(&[
            "work deadlines pile up",
            "struggling to sleep well at night",
            "sleep schedule tips",
        ])?;

        let scored = retriever.retrieve_scored("how do I sleep at night", 3)?;
        assert_eq!(scored.len(), 3);
        assert_eq!(scored[0].0, "struggling to sleep well at night");
        assert!(scored.windows(2).all(|w| w[0].1 >= w[1].1));

        let texts = retriever.retrieve("how do I sleep at night", 2)?;
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], scored[0].0);
        Ok(())
    }

    #[test]
    fn test_zero_k_is_empty_not_error() -> Result<()> {
        let retriever = retriever(&["anything"])?;
        assert!(retriever.retrieve("anything", 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_end_to_end_example_returns_both_documents() -> Result<()> {
        let retriever = retriever(&["feeling anxious before exams", "struggling to sleep well"])?;
        let texts = retriever.retrieve("I can't sleep before my exam", 2)?;
        assert_eq!(texts.len(), 2);
        assert!(texts.contains(&"feeling anxious before exams".to_string()));
        assert!(texts.contains(&"struggling to sleep well".to_string()));
        Ok(())
    }
}
