use std::env;
use std::path::PathBuf;
use std::time::Instant;

use tts_corpus::{
    config::PipelineConfig,
    frontend::{EspeakFrontend, FeatureTable, TextFrontend},
    models::{
        onnx::{OnnxAcousticModel, OnnxSpeakerEncoder, SessionOptions},
        ModelSet,
    },
    pipeline::CorpusPipeline,
    transcripts, CorpusError,
};

/// Usage: build_corpus <transcripts> <phone_features.json> <aligner.onnx>
///        [speaker.onnx] [config.json]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!(
            "usage: build_corpus <transcripts> <phone_features.json> <aligner.onnx> \
             [speaker.onnx] [config.json]"
        );
        std::process::exit(2);
    }
    let transcripts_path = PathBuf::from(&args[0]);
    let table_path = PathBuf::from(&args[1]);
    let aligner_path = PathBuf::from(&args[2]);
    let speaker_path = args.get(3).map(PathBuf::from);

    let config = match args.get(4) {
        Some(path) => PipelineConfig::from_json_file(path.as_ref())?,
        None => PipelineConfig {
            speaker_embedding: speaker_path.is_some(),
            ..Default::default()
        },
    };

    let transcripts = transcripts::load(&transcripts_path)?;
    let table = FeatureTable::load(&table_path)?;
    println!("{} transcripts, {} phones", transcripts.len(), table.len());

    let frontend = move || -> Result<Box<dyn TextFrontend>, CorpusError> {
        Ok(Box::new(EspeakFrontend::new(table.clone())))
    };
    let session = SessionOptions {
        num_threads: Some(1),
        ..Default::default()
    };
    let mut models = ModelSet::new(
        frontend,
        OnnxAcousticModel::factory(&aligner_path, session.clone()),
    );
    if let Some(path) = &speaker_path {
        models = models.with_speaker_encoder(OnnxSpeakerEncoder::factory(path, session));
    }

    let cache_key = transcripts_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corpus".to_string());
    let pipeline = CorpusPipeline::new(config, models, "feature_cache", cache_key)?;

    let start = Instant::now();
    let dataset = pipeline.open(&transcripts)?;
    println!("{} samples ready in {:.2?}", dataset.len(), start.elapsed());

    if let Ok(sample) = dataset.get(0) {
        println!(
            "first sample: {} tokens, {} mel frames, mean pitch {:.1} Hz",
            sample.token_len,
            sample.mel_len,
            sample.pitch.iter().sum::<f32>() / sample.pitch.len().max(1) as f32
        );
    }
    Ok(())
}
