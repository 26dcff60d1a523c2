//! Entry point: load a cached corpus or build and cache a new one.

use std::path::PathBuf;

use crate::builder::{BuildReport, ParallelCacheBuilder};
use crate::cache::{CachedCorpus, DatasetCache};
use crate::config::PipelineConfig;
use crate::dataset::{AlignerCorpus, FeatureDataset};
use crate::error::CorpusError;
use crate::models::ModelSet;
use crate::transcripts::TranscriptMap;

/// Ties builder and cache together for one cache key.
pub struct CorpusPipeline {
    config: PipelineConfig,
    models: ModelSet,
    cache: DatasetCache,
    cache_key: String,
}

impl CorpusPipeline {
    pub fn new(
        config: PipelineConfig,
        models: ModelSet,
        cache_root: impl Into<PathBuf>,
        cache_key: impl Into<String>,
    ) -> Result<Self, CorpusError> {
        config.validate()?;
        let cache = DatasetCache::new(cache_root, &config);
        Ok(Self {
            config,
            models,
            cache,
            cache_key: cache_key.into(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &DatasetCache {
        &self.cache
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Return the cached corpus if there is one, building it otherwise.
    ///
    /// A cache hit spawns no workers and loads no models.
    pub fn open(&self, transcripts: &TranscriptMap) -> Result<FeatureDataset, CorpusError> {
        if self.config.rebuild || !self.cache.exists(&self.cache_key) {
            return self.rebuild(transcripts);
        }

        match self.cache.load(&self.cache_key) {
            Ok(cached) => wrap(cached),
            Err(e @ CorpusError::CorruptCache { .. }) if self.config.rebuild_on_corrupt_cache => {
                log::warn!("{e}; rebuilding");
                self.cache.remove(&self.cache_key)?;
                self.rebuild(transcripts)
            }
            Err(e) => Err(e),
        }
    }

    /// Build from scratch and overwrite whatever is cached.
    pub fn rebuild(&self, transcripts: &TranscriptMap) -> Result<FeatureDataset, CorpusError> {
        let (dataset, _) = self.rebuild_with_report(transcripts)?;
        Ok(dataset)
    }

    /// Like [`rebuild`](Self::rebuild), also returning the build statistics.
    pub fn rebuild_with_report(
        &self,
        transcripts: &TranscriptMap,
    ) -> Result<(FeatureDataset, BuildReport), CorpusError> {
        let mut builder = ParallelCacheBuilder::new(self.config.clone(), self.models.clone())
            .with_work_dir(self.cache.dir(&self.cache_key));
        let (cached, report) = builder.build(transcripts, self.config.worker_count)?;
        self.cache.save(&self.cache_key, &cached)?;
        Ok((wrap(cached)?, report))
    }

    /// Return the cached aligner corpus if there is one, building it
    /// otherwise. Follows the same rebuild rules as [`open`](Self::open).
    pub fn open_aligner_corpus(
        &self,
        transcripts: &TranscriptMap,
    ) -> Result<AlignerCorpus, CorpusError> {
        if self.config.rebuild || !self.cache.aligner_exists(&self.cache_key) {
            return self.rebuild_aligner_corpus(transcripts);
        }

        match self.cache.load_aligner(&self.cache_key) {
            Ok(corpus) => Ok(corpus),
            Err(e @ CorpusError::CorruptCache { .. }) if self.config.rebuild_on_corrupt_cache => {
                log::warn!("{e}; rebuilding");
                self.cache.remove_aligner(&self.cache_key)?;
                self.rebuild_aligner_corpus(transcripts)
            }
            Err(e) => Err(e),
        }
    }

    /// Build the aligner corpus from scratch and overwrite its cache file.
    pub fn rebuild_aligner_corpus(
        &self,
        transcripts: &TranscriptMap,
    ) -> Result<AlignerCorpus, CorpusError> {
        let mut builder = ParallelCacheBuilder::new(self.config.clone(), self.models.clone())
            .with_work_dir(self.cache.dir(&self.cache_key));
        let (corpus, _) = builder.build_aligner_corpus(transcripts, self.config.worker_count)?;
        self.cache.save_aligner(&self.cache_key, &corpus)?;
        Ok(corpus)
    }
}

fn wrap(cached: CachedCorpus) -> Result<FeatureDataset, CorpusError> {
    match cached.waveforms {
        Some(waveforms) => FeatureDataset::with_waveforms(cached.corpus, waveforms),
        None => Ok(FeatureDataset::new(cached.corpus)),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::audio::normalizer::NORMALIZED_DIR;
    use crate::builder::test_support::{corpus_on_disk, counting_models, fast_config, init_logging};

    fn pipeline(
        root: &std::path::Path,
        config: PipelineConfig,
        loads: &Arc<AtomicUsize>,
    ) -> CorpusPipeline {
        CorpusPipeline::new(config, counting_models(Arc::clone(loads)), root, "corpus")
            .expect("valid config")
    }

    #[test]
    fn second_open_hits_the_cache() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 6);
        let loads = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(cache.path(), fast_config(), &loads);

        let first = pipeline.open(&transcripts).expect("build");
        let built_with = loads.load(Ordering::SeqCst);
        assert!(built_with > 0);
        assert!(pipeline.cache().exists("corpus"));

        let second = pipeline.open(&transcripts).expect("load");
        assert_eq!(loads.load(Ordering::SeqCst), built_with);
        assert_eq!(first.corpus(), second.corpus());
    }

    #[test]
    fn hundred_samples_on_four_workers() {
        init_logging();
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 100);
        let loads = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig {
            worker_count: 4,
            progress_interval: 25,
            ..fast_config()
        };

        let pipeline = pipeline(cache.path(), config, &loads);
        let (dataset, report) = pipeline.rebuild_with_report(&transcripts).expect("build");

        assert_eq!(dataset.len(), 100);
        assert_eq!(report.workers.len(), 4);
        assert!(report.workers.iter().all(|w| w.assigned == 25 && w.completed));
        assert_eq!(loads.load(Ordering::SeqCst), 4);
        for sample in dataset.iter() {
            assert_eq!(
                sample.duration.iter().map(|&d| d as usize).sum::<usize>(),
                sample.mel_len
            );
        }

        let reopened = pipeline.open(&transcripts).expect("reload");
        assert_eq!(reopened.corpus(), dataset.corpus());
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn corrupt_cache_is_reported_then_rebuilt_on_request() {
        init_logging();
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 3);
        let loads = Arc::new(AtomicUsize::new(0));

        let strict = pipeline(cache.path(), fast_config(), &loads);
        strict.open(&transcripts).expect("build");
        fs::write(strict.cache().path("corpus"), b"TTSCRP02 garbage").expect("corrupt");
        assert!(matches!(
            strict.open(&transcripts),
            Err(CorpusError::CorruptCache { .. })
        ));
        assert_eq!(strict.rebuild(&transcripts).expect("forced").len(), 3);

        fs::write(strict.cache().path("corpus"), b"junk").expect("corrupt again");
        let lenient = pipeline(
            cache.path(),
            PipelineConfig {
                rebuild_on_corrupt_cache: true,
                ..fast_config()
            },
            &loads,
        );
        assert_eq!(lenient.open(&transcripts).expect("fallback").len(), 3);
        assert!(lenient.cache().load("corpus").is_ok());
    }

    #[test]
    fn rebuild_flag_ignores_existing_cache() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 2);
        let loads = Arc::new(AtomicUsize::new(0));

        pipeline(cache.path(), fast_config(), &loads)
            .open(&transcripts)
            .expect("build");
        let before = loads.load(Ordering::SeqCst);

        let config = PipelineConfig {
            rebuild: true,
            ..fast_config()
        };
        pipeline(cache.path(), config, &loads)
            .open(&transcripts)
            .expect("rebuild");
        assert!(loads.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn intermediates_are_written_and_reused() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 2);
        let loads = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig {
            persist_intermediates: true,
            ..fast_config()
        };

        let pipeline = pipeline(cache.path(), config, &loads);
        let first = pipeline.rebuild(&transcripts).expect("build");
        let normalized = pipeline.cache().dir("corpus").join(NORMALIZED_DIR);
        assert_eq!(fs::read_dir(&normalized).expect("intermediates").count(), 2);

        // Drop the sources; the second build runs from the intermediates.
        for path in transcripts.keys() {
            fs::remove_file(path).expect("remove source");
        }
        let second = pipeline.rebuild(&transcripts).expect("rebuild");
        assert_eq!(second.len(), first.len());
    }

    #[test]
    fn retained_waveforms_survive_the_cache() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 2);
        let loads = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig {
            retain_waveforms: true,
            ..fast_config()
        };

        let pipeline = pipeline(cache.path(), config, &loads);
        pipeline.open(&transcripts).expect("build");
        let reopened = pipeline.open(&transcripts).expect("load");
        let wave = reopened.waveform(0).expect("in range").expect("retained");
        // 1.5 s at 8 kHz, minus any trimmed edge zeros.
        assert!((11_990..=12_000).contains(&wave.len()), "{}", wave.len());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let loads = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig {
            reduction_factor: 0,
            ..fast_config()
        };
        assert!(matches!(
            CorpusPipeline::new(config, counting_models(loads), "unused", "k"),
            Err(CorpusError::Config(_))
        ));
    }

    #[test]
    fn aligner_corpus_is_cached_next_to_the_features() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 3);
        let loads = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(cache.path(), fast_config(), &loads);

        let built = pipeline.open_aligner_corpus(&transcripts).expect("build");
        assert_eq!(built.len(), 3);
        assert!(pipeline.cache().aligner_exists("corpus"));
        assert!(!pipeline.cache().exists("corpus"));
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        for path in transcripts.keys() {
            fs::remove_file(path).expect("remove source");
        }
        let reopened = pipeline.open_aligner_corpus(&transcripts).expect("load");
        assert_eq!(reopened, built);
    }

    #[test]
    fn changed_feature_settings_force_a_rebuild_when_allowed() {
        let data = tempfile::tempdir().expect("tempdir");
        let cache = tempfile::tempdir().expect("tempdir");
        let transcripts = corpus_on_disk(data.path(), 2);
        let loads = Arc::new(AtomicUsize::new(0));
        pipeline(cache.path(), fast_config(), &loads)
            .open(&transcripts)
            .expect("build");

        let fewer_bins = PipelineConfig {
            mel_bins: 16,
            ..fast_config()
        };
        assert!(matches!(
            pipeline(cache.path(), fewer_bins.clone(), &loads).open(&transcripts),
            Err(CorpusError::CorruptCache { .. })
        ));

        let lenient = pipeline(
            cache.path(),
            PipelineConfig {
                rebuild_on_corrupt_cache: true,
                ..fewer_bins
            },
            &loads,
        );
        let rebuilt = lenient.open(&transcripts).expect("rebuild");
        assert!(rebuilt.iter().all(|s| s.mel.ncols() == 16));
    }
}
