use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// A corpus entry ready for embedding. `metadata["id"]` always holds an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub text: String,
    pub metadata: BTreeMap<String, Value>,
}

impl DocumentRecord {
    pub fn new(text: impl Into<String>, id: u64) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("id".to_string(), Value::from(id));
        Self {
            text: text.into(),
            metadata,
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.metadata.get("id").and_then(Value::as_u64)
    }
}

/// Reads a corpus into records, preserving source order.
///
/// A file source must be a JSON array. A directory source is walked for
/// `.txt` files, each split into sentence-bounded chunks.
#[derive(Debug, Clone)]
pub struct CorpusLoader {
    chunk_max_chars: usize,
}

impl Default for CorpusLoader {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1000,
        }
    }
}

impl CorpusLoader {
    pub fn new(chunk_max_chars: usize) -> Self {
        Self {
            chunk_max_chars: chunk_max_chars.max(1),
        }
    }

    pub fn load(&self, source: impl AsRef<Path>) -> Result<Vec<DocumentRecord>> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(PipelineError::corpus_format(source, "corpus source does not exist"));
        }

        let records = if source.is_dir() {
            self.load_text_dir(source)?
        } else {
            let raw = fs::read_to_string(source)?;
            parse_json_corpus(source, &raw)?
        };

        info!(source = ?source, records = records.len(), "Loaded corpus");
        Ok(records)
    }

    fn load_text_dir(&self, dir: &Path) -> Result<Vec<DocumentRecord>> {
        let mut files = Vec::new();
        collect_text_files(dir, &mut files)?;
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let content = fs::read_to_string(&path)?;
            let chunks = split_into_chunks(&content, self.chunk_max_chars);
            debug!(file = ?path, chunks = chunks.len(), "Chunked corpus file");

            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                let mut record = DocumentRecord::new(chunk, records.len() as u64);
                record
                    .metadata
                    .insert("source".into(), Value::from(path.display().to_string()));
                record
                    .metadata
                    .insert("chunk".into(), Value::from(chunk_index as u64));
                records.push(record);
            }
        }

        Ok(records)
    }
}

fn parse_json_corpus(path: &Path, raw: &str) -> Result<Vec<DocumentRecord>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| PipelineError::corpus_format(path, e))?;
    let Value::Array(rows) = value else {
        return Err(PipelineError::corpus_format(
            path,
            "expected a top-level JSON array of records",
        ));
    };

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(position, row)| record_from_row(position as u64, row))
        .collect())
}

fn record_from_row(position: u64, row: Value) -> DocumentRecord {
    match row {
        Value::String(text) => DocumentRecord::new(text, position),
        Value::Object(ref fields) => {
            let text = match fields.get("text") {
                Some(Value::String(text)) => text.clone(),
                _ => row.to_string(),
            };
            let id = fields.get("id").and_then(Value::as_u64).unwrap_or(position);

            let mut record = DocumentRecord::new(text, id);
            for (key, value) in fields {
                if key != "text" && key != "id" {
                    record.metadata.insert(key.clone(), value.clone());
                }
            }
            record
        }
        other => DocumentRecord::new(other.to_string(), position),
    }
}

fn collect_text_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() {
            if path.extension().is_some_and(|ext| ext == "txt") {
                files.push(path);
            }
        } else if path.is_dir() {
            collect_text_files(&path, files)?;
        }
    }
    Ok(())
}

/// Splits text into chunks of at most `max_chars` characters, preferring
/// sentence boundaries, then word boundaries, then character boundaries.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();
    let mut current_length = 0;

    for sentence in text.split(['.', '!', '?']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        let sentence_len = sentence.chars().count();
        if sentence_len + 1 > max_chars {
            if !current_chunk.is_empty() {
                chunks.push(current_chunk.trim().to_string());
                current_chunk.clear();
                current_length = 0;
            }
            split_oversized(&format!("{sentence}."), max_chars, &mut chunks);
            continue;
        }

        if current_length + sentence_len + 2 > max_chars && !current_chunk.is_empty() {
            chunks.push(current_chunk.trim().to_string());
            current_chunk.clear();
            current_length = 0;
        }

        if !current_chunk.is_empty() {
            current_chunk.push(' ');
            current_length += 1;
        }
        current_chunk.push_str(sentence);
        current_chunk.push('.');
        current_length += sentence_len + 1;
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk.trim().to_string());
    }

    chunks
}

/// Packs the words of one over-long sentence; words that alone exceed the
/// limit are cut at character boundaries.
fn split_oversized(sentence: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    let mut current_length = 0;

    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_length = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|piece| piece.iter().collect::<String>()));
            continue;
        }

        if !current.is_empty() && current_length + 1 + word_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_length = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_length += 1;
        }
        current.push_str(word);
        current_length += word_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
}
