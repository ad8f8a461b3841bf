use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::corpus::CorpusLoader;
use crate::embedder::{Embedder, build_embedder};
use crate::error::Result;
use crate::llm::{GenerationBackend, GroqBackend};
use crate::retriever::Retriever;
use crate::vector_db::VectorIndex;

/// Binds a generation backend from configuration.
pub type BackendBinder =
    Arc<dyn Fn(&PipelineConfig) -> Result<Arc<dyn GenerationBackend>> + Send + Sync>;

/// A ready retriever paired with its bound backend.
pub struct Pipeline {
    pub retriever: Retriever,
    pub backend: Arc<dyn GenerationBackend>,
}

/// Counts of the expensive initialisation steps actually performed.
#[derive(Debug, Default)]
pub struct InitStats {
    index_loads: AtomicUsize,
    index_builds: AtomicUsize,
    backend_binds: AtomicUsize,
}

impl InitStats {
    pub fn index_loads(&self) -> usize {
        self.index_loads.load(Ordering::SeqCst)
    }

    pub fn index_builds(&self) -> usize {
        self.index_builds.load(Ordering::SeqCst)
    }

    pub fn backend_binds(&self) -> usize {
        self.backend_binds.load(Ordering::SeqCst)
    }
}

/// Lazily builds the pipeline once and hands out the memoised result.
///
/// Concurrent first callers wait on a single initialiser. A failed
/// initialisation stores nothing, so the next caller starts from scratch.
pub struct PipelineCache {
    config: PipelineConfig,
    embedder: OnceCell<Arc<dyn Embedder>>,
    binder: BackendBinder,
    cell: OnceCell<Arc<Pipeline>>,
    stats: Arc<InitStats>,
}

impl PipelineCache {
    pub fn new(config: PipelineConfig) -> Self {
        let binder: BackendBinder = Arc::new(
            |config: &PipelineConfig| -> Result<Arc<dyn GenerationBackend>> {
                let backend = GroqBackend::from_config(config)?;
                Ok(Arc::new(backend))
            },
        );

        Self {
            config,
            embedder: OnceCell::new(),
            binder,
            cell: OnceCell::new(),
            stats: Arc::new(InitStats::default()),
        }
    }

    /// Uses `embedder` instead of the one named by `embedding_backend`.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = OnceCell::new_with(Some(embedder));
        self
    }

    pub fn with_backend_binder(mut self, binder: BackendBinder) -> Self {
        self.binder = binder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &InitStats {
        &self.stats
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get_or_init(&self) -> Result<Arc<Pipeline>> {
        self.cell
            .get_or_try_init(|| self.initialize())
            .await
            .cloned()
    }

    /// Drops the memoised pipeline; the next call initialises again.
    ///
    /// Needs exclusive access, so a cache already shared behind an `Arc` cannot
    /// be reset. Build a fresh `PipelineCache` for that instead.
    pub fn reset(&mut self) {
        self.cell.take();
    }

    /// Rebuilds the persisted index from the corpus, ignoring any saved copy.
    ///
    /// A pipeline already memoised here keeps serving the index it was built
    /// with. The rebuilt file is picked up by a new cache, or by this one
    /// after `reset`.
    #[instrument(skip_all)]
    pub async fn rebuild_index(&self) -> Result<usize> {
        let index = self.spawn_index_task(true).await?;
        Ok(index.len())
    }

    #[instrument(skip_all)]
    async fn initialize(&self) -> Result<Arc<Pipeline>> {
        info!("Initializing retrieval pipeline");

        // Credentials are cheap to check, so bind before the expensive index work.
        let backend = (self.binder)(&self.config)?;
        self.stats.backend_binds.fetch_add(1, Ordering::SeqCst);

        let embedder = self.embedder().await?;
        let index = self.spawn_index_task(false).await?;
        let retriever = Retriever::new(embedder, Arc::new(index));

        info!(
            documents = retriever.index().len(),
            backend = backend.name(),
            "Retrieval pipeline ready"
        );
        Ok(Arc::new(Pipeline { retriever, backend }))
    }

    /// The configured embedder, loaded once per cache.
    pub async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        self.embedder
            .get_or_try_init(|| self.load_embedder())
            .await
            .cloned()
    }

    async fn load_embedder(&self) -> Result<Arc<dyn Embedder>> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || build_embedder(&config)).await?
    }

    async fn spawn_index_task(&self, force_rebuild: bool) -> Result<VectorIndex> {
        let config = self.config.clone();
        let embedder = self.embedder().await?;
        let stats = self.stats.clone();

        tokio::task::spawn_blocking(move || {
            load_or_build_index(&config, embedder.as_ref(), &stats, force_rebuild)
        })
        .await?
    }
}

fn load_or_build_index(
    config: &PipelineConfig,
    embedder: &dyn Embedder,
    stats: &InitStats,
    force_rebuild: bool,
) -> Result<VectorIndex> {
    if !force_rebuild {
        match VectorIndex::load(&config.index_path, embedder) {
            Ok(index) => {
                stats.index_loads.fetch_add(1, Ordering::SeqCst);
                return Ok(index);
            }
            Err(err) if err.is_recoverable_index_error() => {
                warn!(error = %err, "Persisted index unusable, rebuilding from corpus");
            }
            Err(err) => return Err(err),
        }
    }

    let records = CorpusLoader::new(config.chunk_max_chars).load(&config.corpus_path)?;
    let index = VectorIndex::build(records, embedder)?;
    stats.index_builds.fetch_add(1, Ordering::SeqCst);
    index.save(&config.index_path)?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{EmbeddingBackend, HashedEmbedder};
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    struct StaticBackend;

    #[async_trait]
    impl GenerationBackend for StaticBackend {
        fn name(&self) -> &str {
            "static"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok("ok".into())
        }
    }

    fn static_binder() -> BackendBinder {
        Arc::new(|_: &PipelineConfig| -> Result<Arc<dyn GenerationBackend>> {
            Ok(Arc::new(StaticBackend))
        })
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            groq_api_key: Some("test-key".into()),
            corpus_path: dir.join("corpus.json"),
            index_path: dir.join("index").join("index.json"),
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimension: 64,
            ..PipelineConfig::default()
        }
    }

    fn write_corpus(config: &PipelineConfig) -> Result<()> {
        fs::write(
            &config.corpus_path,
            r#"[{"text":"feeling anxious before exams"},{"text":"struggling to sleep well"}]"#,
        )?;
        Ok(())
    }

    #[tokio::test]
    async fn test_first_use_builds_then_memoises() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;
        let cache = PipelineCache::new(config.clone()).with_backend_binder(static_binder());

        assert!(!cache.is_initialized());
        let first = cache.get_or_init().await?;
        let second = cache.get_or_init().await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().index_builds(), 1);
        assert_eq!(cache.stats().index_loads(), 0);
        assert_eq!(cache.stats().backend_binds(), 1);
        assert!(config.index_path.is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_process_loads_persisted_index() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;

        PipelineCache::new(config.clone())
            .with_backend_binder(static_binder())
            .get_or_init()
            .await?;

        let cache = PipelineCache::new(config).with_backend_binder(static_binder());
        let pipeline = cache.get_or_init().await?;
        assert_eq!(pipeline.retriever.index().len(), 2);
        assert_eq!(cache.stats().index_loads(), 1);
        assert_eq!(cache.stats().index_builds(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_index_is_rebuilt() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;
        fs::create_dir_all(dir.path().join("index"))?;
        fs::write(&config.index_path, "not json")?;

        let cache = PipelineCache::new(config.clone()).with_backend_binder(static_binder());
        cache.get_or_init().await?;
        assert_eq!(cache.stats().index_builds(), 1);
        assert!(VectorIndex::load(&config.index_path, &HashedEmbedder::new(64)).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_fast_without_memoising() -> Result<()> {
        let dir = tempdir()?;
        let mut config = test_config(dir.path());
        config.groq_api_key = None;
        write_corpus(&config)?;

        let cache = PipelineCache::new(config);
        assert!(matches!(
            cache.get_or_init().await,
            Err(PipelineError::Configuration(_))
        ));
        assert!(!cache.is_initialized());
        assert_eq!(cache.stats().index_builds(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_corpus_is_fatal_and_retried_later() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        fs::write(&config.corpus_path, "[]")?;

        let cache = PipelineCache::new(config.clone()).with_backend_binder(static_binder());
        assert!(matches!(
            cache.get_or_init().await,
            Err(PipelineError::EmptyCorpus)
        ));
        assert!(!cache.is_initialized());
        assert!(!config.index_path.exists());

        write_corpus(&config)?;
        cache.get_or_init().await?;
        assert!(cache.is_initialized());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_and_rebuild() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;
        let mut cache = PipelineCache::new(config).with_backend_binder(static_binder());

        cache.get_or_init().await?;
        cache.reset();
        assert!(!cache.is_initialized());
        cache.get_or_init().await?;
        assert_eq!(cache.stats().index_loads(), 1);

        assert_eq!(cache.rebuild_index().await?, 2);
        assert_eq!(cache.stats().index_builds(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rebuild_leaves_memoised_pipeline_untouched() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;
        let cache = PipelineCache::new(config.clone()).with_backend_binder(static_binder());
        let before = cache.get_or_init().await?;

        fs::write(
            &config.corpus_path,
            r#"[{"text":"feeling anxious before exams"},{"text":"struggling to sleep well"},{"text":"missing home"}]"#,
        )?;
        assert_eq!(cache.rebuild_index().await?, 3);

        let after = cache.get_or_init().await?;
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.retriever.index().len(), 2);

        let fresh = PipelineCache::new(config).with_backend_binder(static_binder());
        assert_eq!(fresh.get_or_init().await?.retriever.index().len(), 3);
        assert_eq!(fresh.stats().index_loads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedder_follows_configured_backend() -> Result<()> {
        let dir = tempdir()?;
        let config = test_config(dir.path());
        write_corpus(&config)?;

        let cache = PipelineCache::new(config.clone()).with_backend_binder(static_binder());
        let pipeline = cache.get_or_init().await?;
        assert_eq!(pipeline.retriever.index().embedding_model(), "hashed-tf-v1-64");

        let custom = PipelineCache::new(config)
            .with_backend_binder(static_binder())
            .with_embedder(Arc::new(HashedEmbedder::new(32)));
        assert_eq!(custom.embedder().await?.dimension(), 32);
        let pipeline = custom.get_or_init().await?;
        assert_eq!(pipeline.retriever.index().dimension(), 32);
        assert_eq!(custom.stats().index_builds(), 1);
        Ok(())
    }
}
