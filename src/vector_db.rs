use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::corpus::DocumentRecord;
use crate::embedder::{Embedder, cosine_similarity};
use crate::error::{PipelineError, Result};

/// Bumped whenever the on-disk layout changes.
pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    embedding: Vec<f32>,
    record: DocumentRecord,
}

/// A scored hit; `record` borrows from the index.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub record: &'a DocumentRecord,
    pub score: f32,
}

/// Exhaustive cosine index over embedded corpus records.
///
/// Immutable after `build`/`load`, so it can be shared behind an `Arc` and
/// queried concurrently without locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    format_version: u32,
    embedding_model: String,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn build(records: Vec<DocumentRecord>, embedder: &dyn Embedder) -> Result<Self> {
        if records.is_empty() {
            return Err(PipelineError::EmptyCorpus);
        }

        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        let dimension = embedder.dimension();

        let mut entries = Vec::with_capacity(records.len());
        for (record, embedding) in records.into_iter().zip(embeddings) {
            if embedding.len() != dimension {
                return Err(PipelineError::DimensionMismatch {
                    expected: dimension,
                    actual: embedding.len(),
                });
            }
            entries.push(IndexEntry { embedding, record });
        }

        info!(
            documents = entries.len(),
            dimension,
            model = embedder.model_id(),
            "Built vector index"
        );

        Ok(Self {
            format_version: INDEX_FORMAT_VERSION,
            embedding_model: embedder.model_id().to_string(),
            dimension,
            entries,
        })
    }

    /// Writes to a sibling temp file, then renames over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, self).map_err(std::io::Error::from)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = ?path, documents = self.entries.len(), "Saved vector index");
        Ok(())
    }

    /// Loads an index and checks it against the embedder that will query it.
    pub fn load(path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PipelineError::IndexNotFound(path.to_path_buf()));
        }

        let reader = BufReader::new(File::open(path)?);
        let index: VectorIndex = serde_json::from_reader(reader)
            .map_err(|e| PipelineError::index_corrupt(path, e))?;

        if index.format_version != INDEX_FORMAT_VERSION {
            return Err(PipelineError::index_corrupt(
                path,
                format!(
                    "format version {} is not supported (expected {INDEX_FORMAT_VERSION})",
                    index.format_version
                ),
            ));
        }
        if index.embedding_model != embedder.model_id() {
            return Err(PipelineError::index_corrupt(
                path,
                format!(
                    "built with embedding model '{}' but '{}' is in use",
                    index.embedding_model,
                    embedder.model_id()
                ),
            ));
        }
        if index.dimension != embedder.dimension() {
            return Err(PipelineError::index_corrupt(
                path,
                format!(
                    "dimension {} does not match embedder dimension {}",
                    index.dimension,
                    embedder.dimension()
                ),
            ));
        }
        if index.entries.is_empty() {
            return Err(PipelineError::index_corrupt(path, "index holds no documents"));
        }
        if let Some(position) = index
            .entries
            .iter()
            .position(|entry| entry.embedding.len() != index.dimension)
        {
            return Err(PipelineError::index_corrupt(
                path,
                format!("entry {position} has the wrong dimensionality"),
            ));
        }

        info!(path = ?path, documents = index.entries.len(), "Loaded vector index");
        Ok(index)
    }

    /// Top `k` records by cosine similarity. Equal scores keep insertion order.
    pub fn query(&self, vector: &[f32], k: NonZeroUsize) -> Result<Vec<SearchHit<'_>>> {
        if vector.len() != self.dimension {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, cosine_similarity(&entry.embedding, vector)))
            .collect();

        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        Ok(scored
            .into_iter()
            .take(k.get())
            .map(|(position, score)| SearchHit {
                record: &self.entries[position].record,
                score,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }
}
