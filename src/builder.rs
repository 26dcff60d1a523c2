//! Parallel construction of feature and aligner corpora.
//!
//! The transcript map is shuffled with the configured seed and cut into
//! contiguous shares, one per worker. Each worker loads its own models and
//! processes its share in order, sending every finished sample over a
//! channel to a single collector on the calling thread. Once all workers
//! have been joined the collected samples are materialized into an
//! immutable [`Corpus`] or [`AlignerCorpus`].
//!
//! Sample order across workers depends on scheduling and is not stable
//! between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::audio::{AudioNormalizer, SignalProcessor, StftProcessor, Waveform};
use crate::cache::CachedCorpus;
use crate::config::{PipelineConfig, WorkerCrashPolicy};
use crate::dataset::{AlignerCorpus, Corpus};
use crate::error::{CorpusError, RejectionReason, SampleRejection};
use crate::features::{DurationExtractor, EnergyExtractor, PitchExtractor};
use crate::frontend::TextFrontend;
use crate::models::{AcousticModel, ModelSet, SpeakerEncoder};
use crate::transcripts::TranscriptMap;
use crate::validator::CorpusValidator;
use crate::{AlignerSample, FeatureTuple, SPEAKER_ENCODER_SAMPLE_RATE};

/// Lifecycle of a corpus build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    Building,
    /// Terminal until [`ParallelCacheBuilder::reset`] is called.
    Built,
}

/// Outcome of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: usize,
    pub assigned: usize,
    pub processed: usize,
    pub accepted: usize,
    /// False when the worker died before finishing its share.
    pub completed: bool,
}

/// Statistics of a finished build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub requested: usize,
    pub accepted: usize,
    pub dropped: BTreeMap<RejectionReason, usize>,
    pub workers: Vec<WorkerSummary>,
    pub crashed_workers: Vec<usize>,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    fn log(&self) {
        log::info!(
            "Prepared {} of {} samples in {:.1?} ({} dropped)",
            self.accepted,
            self.requested,
            self.elapsed,
            self.dropped_total()
        );
        for (reason, count) in &self.dropped {
            log::info!("  dropped {count} x {reason:?}");
        }
        if !self.crashed_workers.is_empty() {
            log::error!(
                "Workers {:?} did not finish; their remaining samples are missing",
                self.crashed_workers
            );
        }
    }
}

/// A sample that passed every check, plus its waveform when retained.
struct ProcessedSample {
    tuple: FeatureTuple,
    waveform: Option<Vec<f32>>,
}

enum WorkerMessage<S> {
    Accepted(Box<S>),
    Rejected(SampleRejection),
}

/// Which corpus a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CorpusKind {
    /// Aligned feature tuples; needs the acoustic model.
    Features,
    /// Tokens, mel and waveform for training the aligner itself.
    Aligner,
}

/// Builds a corpus from a transcript map using a pool of worker threads.
pub struct ParallelCacheBuilder {
    config: PipelineConfig,
    models: ModelSet,
    dsp: Arc<dyn SignalProcessor>,
    work_dir: Option<PathBuf>,
    state: BuildState,
}

impl ParallelCacheBuilder {
    pub fn new(config: PipelineConfig, models: ModelSet) -> Self {
        let dsp = models.signal_processor.clone().unwrap_or_else(|| {
            Arc::new(StftProcessor::new(
                config.target_sample_rate,
                config.n_fft,
                config.hop_length,
                config.mel_bins,
            ))
        });
        Self {
            config,
            models,
            dsp,
            work_dir: None,
            state: BuildState::Unbuilt,
        }
    }

    /// Directory for normalized-audio intermediates.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Allow another build after a finished one.
    pub fn reset(&mut self) {
        self.state = BuildState::Unbuilt;
    }

    /// Run all workers over `transcripts` and collect the accepted samples.
    pub fn build(
        &mut self,
        transcripts: &TranscriptMap,
        worker_count: usize,
    ) -> Result<(CachedCorpus, BuildReport), CorpusError> {
        self.begin(worker_count, CorpusKind::Features)?;
        let result = self
            .run(transcripts, worker_count, CorpusKind::Features, |worker, path, text, dir| {
                worker.process(path, text, dir)
            })
            .map(|(samples, report)| (self.materialize(samples), report));
        self.finish(result)
    }

    /// Build the corpus the aligner is trained on.
    ///
    /// Samples are normalized, tokenized and turned into mel spectrograms
    /// like in [`build`](Self::build), but nothing is aligned: no acoustic
    /// or speaker model is loaded and no durations, pitch or energy are
    /// computed. Every sample keeps its normalized waveform.
    pub fn build_aligner_corpus(
        &mut self,
        transcripts: &TranscriptMap,
        worker_count: usize,
    ) -> Result<(AlignerCorpus, BuildReport), CorpusError> {
        self.begin(worker_count, CorpusKind::Aligner)?;
        let result = self
            .run(transcripts, worker_count, CorpusKind::Aligner, |worker, path, text, dir| {
                worker.process_for_aligner(path, text, dir)
            })
            .map(|(samples, report)| (AlignerCorpus::new(samples), report));
        self.finish(result)
    }

    fn begin(&mut self, worker_count: usize, kind: CorpusKind) -> Result<(), CorpusError> {
        match self.state {
            BuildState::Built => return Err(CorpusError::AlreadyBuilt),
            BuildState::Building => {
                return Err(CorpusError::Config("a build is already running".into()))
            }
            BuildState::Unbuilt => {}
        }
        if worker_count == 0 {
            return Err(CorpusError::NoWorkers);
        }
        self.config.validate()?;
        if kind == CorpusKind::Features {
            if self.models.acoustic.is_none() {
                return Err(CorpusError::Config(
                    "a feature corpus needs an acoustic model".into(),
                ));
            }
            if self.config.speaker_embedding && self.models.speaker.is_none() {
                return Err(CorpusError::Config(
                    "speaker_embedding is enabled but no speaker encoder was provided".into(),
                ));
            }
        }
        self.state = BuildState::Building;
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T, CorpusError>) -> Result<T, CorpusError> {
        self.state = match result {
            Ok(_) => BuildState::Built,
            Err(_) => BuildState::Unbuilt,
        };
        result
    }

    fn run<S, F>(
        &self,
        transcripts: &TranscriptMap,
        worker_count: usize,
        kind: CorpusKind,
        process: F,
    ) -> Result<(Vec<S>, BuildReport), CorpusError>
    where
        S: Send,
        F: Fn(&mut Worker<'_>, &Path, &str, Option<&Path>) -> Result<S, SampleRejection> + Sync,
    {
        let started = Instant::now();
        let mut keys: Vec<&PathBuf> = transcripts.keys().collect();
        keys.shuffle(&mut StdRng::seed_from_u64(self.config.seed));

        let n = keys.len();
        let shares: Vec<&[&PathBuf]> = (0..worker_count)
            .map(|i| &keys[i * n / worker_count..(i + 1) * n / worker_count])
            .filter(|share| !share.is_empty())
            .collect();
        log::info!(
            "Building {kind:?} corpus from {n} transcripts with {} workers",
            shares.len()
        );

        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMessage<S>>();
        let mut collected: Vec<S> = Vec::with_capacity(n);
        let mut dropped: BTreeMap<RejectionReason, usize> = BTreeMap::new();
        let mut workers = Vec::with_capacity(shares.len());
        let mut crashed = Vec::new();
        let process = &process;

        thread::scope(|scope| -> Result<(), CorpusError> {
            let mut handles = Vec::with_capacity(shares.len());
            for (id, share) in shares.iter().enumerate() {
                let tx = tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("corpus-worker-{id}"))
                    .spawn_scoped(scope, move || {
                        self.run_worker(id, share, transcripts, tx, kind, process)
                    })?;
                handles.push((id, share.len(), handle));
            }
            drop(tx);

            // Ends once every worker has dropped its sender, crashed or not.
            for message in rx {
                match message {
                    WorkerMessage::Accepted(sample) => collected.push(*sample),
                    WorkerMessage::Rejected(rejection) => {
                        *dropped.entry(rejection.reason()).or_default() += 1;
                    }
                }
            }

            for (id, assigned, handle) in handles {
                match handle.join() {
                    Ok(Ok(summary)) => workers.push(summary),
                    Ok(Err(e)) => {
                        log::error!("Worker {id} failed before finishing its share: {e}");
                        crashed.push(id);
                        workers.push(WorkerSummary {
                            worker: id,
                            assigned,
                            ..Default::default()
                        });
                    }
                    Err(_) => {
                        log::error!("Worker {id} panicked; its remaining samples are lost");
                        crashed.push(id);
                        workers.push(WorkerSummary {
                            worker: id,
                            assigned,
                            ..Default::default()
                        });
                    }
                }
            }
            Ok(())
        })?;

        if let (Some(&worker), WorkerCrashPolicy::Fail) = (crashed.first(), self.config.crash_policy)
        {
            return Err(CorpusError::WorkerCrashed { worker });
        }

        let report = BuildReport {
            requested: n,
            accepted: collected.len(),
            dropped,
            workers,
            crashed_workers: crashed,
            elapsed: started.elapsed(),
        };
        report.log();
        Ok((collected, report))
    }

    /// Single pass over the collected samples once all workers are gone.
    fn materialize(&self, collected: Vec<ProcessedSample>) -> CachedCorpus {
        let mut tuples = Vec::with_capacity(collected.len());
        let mut waveforms = self
            .config
            .retain_waveforms
            .then(|| Vec::with_capacity(collected.len()));

        for sample in collected {
            tuples.push(sample.tuple);
            if let Some(waveforms) = waveforms.as_mut() {
                waveforms.push(sample.waveform.unwrap_or_default());
            }
        }

        CachedCorpus {
            corpus: Corpus::new(tuples),
            waveforms,
        }
    }

    fn run_worker<S, F>(
        &self,
        id: usize,
        share: &[&PathBuf],
        transcripts: &TranscriptMap,
        tx: Sender<WorkerMessage<S>>,
        kind: CorpusKind,
        process: &F,
    ) -> Result<WorkerSummary, CorpusError>
    where
        F: Fn(&mut Worker<'_>, &Path, &str, Option<&Path>) -> Result<S, SampleRejection>,
    {
        let mut worker = Worker::load(id, &self.config, &self.models, Arc::clone(&self.dsp), kind)?;
        let work_dir = self.work_dir.as_deref();
        let interval = self.config.progress_interval.max(1);
        let mut summary = WorkerSummary {
            worker: id,
            assigned: share.len(),
            ..Default::default()
        };

        for path in share.iter().copied() {
            let transcript = transcripts.get(path).map(String::as_str).unwrap_or("");
            let message = match process(&mut worker, path, transcript, work_dir) {
                Ok(sample) => {
                    summary.accepted += 1;
                    WorkerMessage::Accepted(Box::new(sample))
                }
                Err(rejection) => {
                    log::warn!("Dropping {}: {rejection}", path.display());
                    WorkerMessage::Rejected(rejection)
                }
            };
            summary.processed += 1;
            if tx.send(message).is_err() {
                break;
            }

            if summary.processed % interval == 0 || summary.processed == summary.assigned {
                log::info!(
                    "worker {id}: {}/{} processed, {} kept",
                    summary.processed,
                    summary.assigned,
                    summary.accepted
                );
            }
        }

        summary.completed = summary.processed == summary.assigned;
        Ok(summary)
    }
}

/// Per-worker instances; dropped (and their resources released) when the
/// worker finishes.
struct Worker<'a> {
    id: usize,
    config: &'a PipelineConfig,
    frontend: Box<dyn TextFrontend>,
    acoustic: Option<Box<dyn AcousticModel>>,
    speaker: Option<Box<dyn SpeakerEncoder>>,
    dsp: Arc<dyn SignalProcessor>,
    normalizer: AudioNormalizer,
    validator: CorpusValidator,
    durations: DurationExtractor,
    pitch: PitchExtractor,
    energy: EnergyExtractor,
}

impl<'a> Worker<'a> {
    /// Aligner builds load the text frontend only.
    fn load(
        id: usize,
        config: &'a PipelineConfig,
        models: &ModelSet,
        dsp: Arc<dyn SignalProcessor>,
        kind: CorpusKind,
    ) -> Result<Self, CorpusError> {
        log::debug!("worker {id}: loading models for {kind:?} corpus");
        let features = kind == CorpusKind::Features;
        let acoustic = match (&models.acoustic, features) {
            (Some(factory), true) => Some(factory.load()?),
            _ => None,
        };
        let speaker = match (&models.speaker, features && config.speaker_embedding) {
            (Some(factory), true) => Some(factory.load()?),
            _ => None,
        };
        Ok(Self {
            id,
            config,
            frontend: models.frontend.load()?,
            acoustic,
            speaker,
            normalizer: AudioNormalizer::new(config, Arc::clone(&dsp)),
            validator: CorpusValidator::new(config),
            durations: DurationExtractor::new(config.reduction_factor),
            pitch: PitchExtractor::new(config),
            energy: EnergyExtractor::new(Arc::clone(&dsp), config.reduction_factor),
            dsp,
        })
    }

    fn tokenize(&self, transcript: &str) -> Result<Array2<f32>, SampleRejection> {
        let tokens = self
            .frontend
            .tokenize(transcript, &self.config.language)
            .map_err(|e| SampleRejection::ModelFailure(format!("text frontend: {e}")))?;
        self.validator.check_token_shape(&tokens)?;
        Ok(tokens)
    }

    fn process(
        &mut self,
        path: &Path,
        transcript: &str,
        work_dir: Option<&Path>,
    ) -> Result<ProcessedSample, SampleRejection> {
        self.validator.check_transcript(transcript)?;
        let wave = self.normalizer.prepare(path, work_dir, &self.validator)?;
        let tokens = self.tokenize(transcript)?;

        let mel = self.dsp.mel_spectrogram(&wave.samples);
        let mel_len = mel.nrows();

        let speaker_embedding = match self.speaker.as_mut() {
            Some(encoder) => Some(embed(encoder.as_mut(), &wave, self.dsp.as_ref())?),
            None => None,
        };

        let duration = {
            let acoustic = self
                .acoustic
                .as_mut()
                .ok_or_else(|| SampleRejection::ModelFailure("no acoustic model loaded".into()))?;
            let alignment = acoustic
                .align(&tokens, &mel, speaker_embedding.as_deref())
                .map_err(|e| SampleRejection::ModelFailure(format!("acoustic model: {e}")))?;
            self.durations.extract(alignment.view())?
        };

        let energy = self.energy.extract(&wave.samples, &duration, mel_len);
        let pitch = self.pitch.extract(&wave.samples, &duration, mel_len);

        let tuple = FeatureTuple {
            token_len: tokens.nrows(),
            tokens,
            mel,
            mel_len,
            duration,
            energy,
            pitch,
            speaker_embedding,
        };
        self.validator.check_tuple(&tuple)?;
        log::debug!("worker {}: accepted {}", self.id, path.display());

        Ok(ProcessedSample {
            tuple,
            waveform: self.config.retain_waveforms.then_some(wave.samples),
        })
    }

    fn process_for_aligner(
        &mut self,
        path: &Path,
        transcript: &str,
        work_dir: Option<&Path>,
    ) -> Result<AlignerSample, SampleRejection> {
        self.validator.check_transcript(transcript)?;
        let wave = self.normalizer.prepare(path, work_dir, &self.validator)?;
        let tokens = self.tokenize(transcript)?;
        let mel = self.dsp.mel_spectrogram(&wave.samples);

        let sample = AlignerSample {
            token_len: tokens.nrows(),
            tokens,
            mel_len: mel.nrows(),
            mel,
            waveform: wave.samples,
        };
        self.validator.check_aligner_sample(&sample)?;
        log::debug!("worker {}: accepted {}", self.id, path.display());
        Ok(sample)
    }
}

/// Speaker embedding of `wave`, resampled to the encoder's rate first.
fn embed(
    encoder: &mut dyn SpeakerEncoder,
    wave: &Waveform,
    dsp: &dyn SignalProcessor,
) -> Result<Vec<f32>, SampleRejection> {
    let resampled;
    let input = if wave.sample_rate == SPEAKER_ENCODER_SAMPLE_RATE {
        &wave.samples
    } else {
        resampled = dsp.resample(&wave.samples, wave.sample_rate, SPEAKER_ENCODER_SAMPLE_RATE)?;
        &resampled
    };
    encoder
        .embed(input)
        .map_err(|e| SampleRejection::ModelFailure(format!("speaker encoder: {e}")))
}
