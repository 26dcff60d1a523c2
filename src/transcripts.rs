//! Loading the `audio path → transcript` map a corpus is built from.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::CorpusError;

/// Audio file → transcript. Ordered so partitioning starts from a stable
/// key order before the seeded shuffle.
pub type TranscriptMap = BTreeMap<PathBuf, String>;

/// Load a transcript map from `path`.
///
/// `.json` files hold an object `{ "<audio path>": "<transcript>" }`; any
/// other file is read as pipe-delimited `audio path|transcript` lines.
/// Relative audio paths are resolved against the directory of `path`.
pub fn load(path: &Path) -> Result<TranscriptMap, CorpusError> {
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let raw = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<BTreeMap<PathBuf, String>>(&content)?
        }
        _ => load_delimited(File::open(path)?)?,
    };

    let map: TranscriptMap = raw
        .into_iter()
        .map(|(audio, text)| {
            let audio = if audio.is_relative() {
                base.join(audio)
            } else {
                audio
            };
            (audio, text)
        })
        .collect();
    log::info!("Loaded {} transcripts from {}", map.len(), path.display());
    Ok(map)
}

fn load_delimited(reader: impl io::Read) -> Result<TranscriptMap, CorpusError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'|')
        .quoting(false)
        .flexible(true)
        .from_reader(io::BufReader::new(reader));

    let mut entries = TranscriptMap::new();
    for result in rdr.records() {
        let record = result?;
        match (record.get(0), record.get(1)) {
            (Some(audio), Some(text)) if !audio.trim().is_empty() => {
                entries.insert(PathBuf::from(audio.trim()), text.trim().to_string());
            }
            _ => log::warn!("Skipping incomplete transcript record: {:?}", record),
        }
    }
    Ok(entries)
}
