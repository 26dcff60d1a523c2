//! Crash-safe persistence of built corpora.
//!
//! # Cache Directory Layout
//!
//! ```text
//! <cache root>/<cache key>/
//! ├── feature_cache.bin                 # header + bincode-encoded corpus
//! ├── aligner_cache.bin                 # header + bincode-encoded aligner corpus
//! ├── normalized_audios/                # peak-normalized intermediates
//! └── normalized_unsilenced_audios/     # ... with compressed silences
//! ```
//!
//! Both artifacts start with an 8-byte magic followed by the 32-byte
//! [`PipelineConfig::fingerprint`] of the settings they were built with.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::dataset::{AlignerCorpus, Corpus};
use crate::error::CorpusError;
use crate::validator::CorpusValidator;

/// Name of the feature corpus artifact inside a cache key's directory.
pub const CACHE_FILE: &str = "feature_cache.bin";
/// Name of the aligner corpus artifact.
pub const ALIGNER_CACHE_FILE: &str = "aligner_cache.bin";

/// Leading bytes of each artifact; bumped when its layout changes.
const FEATURE_MAGIC: &[u8; 8] = b"TTSCRP02";
const ALIGNER_MAGIC: &[u8; 8] = b"TTSALN01";

/// What gets written to disk: the corpus and, optionally, the normalized
/// waveforms it was computed from (index-aligned).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedCorpus {
    pub corpus: Corpus,
    pub waveforms: Option<Vec<Vec<f32>>>,
}

/// On-disk store of built corpora, one directory per cache key.
pub struct DatasetCache {
    root: PathBuf,
    validator: CorpusValidator,
    fingerprint: [u8; 32],
}

impl DatasetCache {
    pub fn new(root: impl Into<PathBuf>, config: &PipelineConfig) -> Self {
        Self {
            root: root.into(),
            validator: CorpusValidator::new(config),
            fingerprint: config.fingerprint(),
        }
    }

    /// Working directory of `cache_key`; intermediates live here too.
    pub fn dir(&self, cache_key: &str) -> PathBuf {
        self.root.join(cache_key)
    }

    pub fn path(&self, cache_key: &str) -> PathBuf {
        self.dir(cache_key).join(CACHE_FILE)
    }

    pub fn aligner_path(&self, cache_key: &str) -> PathBuf {
        self.dir(cache_key).join(ALIGNER_CACHE_FILE)
    }

    pub fn exists(&self, cache_key: &str) -> bool {
        self.path(cache_key).is_file()
    }

    pub fn aligner_exists(&self, cache_key: &str) -> bool {
        self.aligner_path(cache_key).is_file()
    }

    /// Decode and re-check a cached corpus.
    ///
    /// A foreign header, a file built with different feature settings, any
    /// decoding failure, trailing garbage or a sample that violates the
    /// feature invariants turns into [`CorpusError::CorruptCache`].
    pub fn load(&self, cache_key: &str) -> Result<CachedCorpus, CorpusError> {
        let path = self.path(cache_key);
        let cached: CachedCorpus = self.read(&path, FEATURE_MAGIC)?;
        self.verify(&cached)
            .map_err(|reason| CorpusError::corrupt(&path, reason))?;

        log::info!(
            "Loaded {} samples from {}",
            cached.corpus.len(),
            path.display()
        );
        Ok(cached)
    }

    fn verify(&self, cached: &CachedCorpus) -> Result<(), String> {
        for (index, sample) in cached.corpus.samples().iter().enumerate() {
            self.validator
                .check_tuple(sample)
                .map_err(|e| format!("sample {index}: {e}"))?;
        }
        if let Some(waveforms) = &cached.waveforms {
            if waveforms.len() != cached.corpus.len() {
                return Err(format!(
                    "{} waveforms for {} samples",
                    waveforms.len(),
                    cached.corpus.len()
                ));
            }
        }
        Ok(())
    }

    /// Write `cached` under `cache_key`.
    ///
    /// The bytes go to a temp file that is synced and then renamed over the
    /// final path, so a crash leaves either the old cache or the new one.
    pub fn save(&self, cache_key: &str, cached: &CachedCorpus) -> Result<(), CorpusError> {
        let path = self.path(cache_key);
        let size = self.write(&path, FEATURE_MAGIC, cached)?;
        log::info!(
            "Saved {} samples ({:.1} MB) to {}",
            cached.corpus.len(),
            size as f64 / 1_048_576.0,
            path.display()
        );
        Ok(())
    }

    /// Decode a cached aligner corpus, re-checking every sample.
    pub fn load_aligner(&self, cache_key: &str) -> Result<AlignerCorpus, CorpusError> {
        let path = self.aligner_path(cache_key);
        let corpus: AlignerCorpus = self.read(&path, ALIGNER_MAGIC)?;
        for (index, sample) in corpus.samples().iter().enumerate() {
            self.validator
                .check_aligner_sample(sample)
                .map_err(|e| CorpusError::corrupt(&path, format!("sample {index}: {e}")))?;
        }
        log::info!("Loaded {} aligner samples from {}", corpus.len(), path.display());
        Ok(corpus)
    }

    pub fn save_aligner(&self, cache_key: &str, corpus: &AlignerCorpus) -> Result<(), CorpusError> {
        let path = self.aligner_path(cache_key);
        let size = self.write(&path, ALIGNER_MAGIC, corpus)?;
        log::info!(
            "Saved {} aligner samples ({:.1} MB) to {}",
            corpus.len(),
            size as f64 / 1_048_576.0,
            path.display()
        );
        Ok(())
    }

    /// Delete the feature artifact of `cache_key`, keeping the intermediates.
    pub fn remove(&self, cache_key: &str) -> Result<(), CorpusError> {
        remove_if_present(&self.path(cache_key))
    }

    pub fn remove_aligner(&self, cache_key: &str) -> Result<(), CorpusError> {
        remove_if_present(&self.aligner_path(cache_key))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path, magic: &[u8; 8]) -> Result<T, CorpusError> {
        let data = fs::read(path)?;

        let rest = data
            .strip_prefix(magic.as_slice())
            .ok_or_else(|| CorpusError::corrupt(path, "missing cache header"))?;
        let payload = rest
            .strip_prefix(self.fingerprint.as_slice())
            .ok_or_else(|| CorpusError::corrupt(path, "built with different feature settings"))?;

        let (value, read): (T, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| CorpusError::corrupt(path, e))?;
        if read != payload.len() {
            return Err(CorpusError::corrupt(
                path,
                format!("{} trailing bytes", payload.len() - read),
            ));
        }
        Ok(value)
    }

    /// Atomically replace `path`; returns the number of bytes written.
    fn write<T: Serialize>(
        &self,
        path: &Path,
        magic: &[u8; 8],
        value: &T,
    ) -> Result<usize, CorpusError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = magic.to_vec();
        bytes.extend_from_slice(&self.fingerprint);
        bytes.extend(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?);

        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        sync_parent_dir(path)?;
        Ok(bytes.len())
    }
}

fn remove_if_present(path: &Path) -> Result<(), CorpusError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sync_parent_dir(path: &Path) -> Result<(), CorpusError> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            fs::File::open(parent)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
