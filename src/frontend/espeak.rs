use std::borrow::Cow;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use ndarray::Array2;

use super::table::FeatureTable;
use super::TextFrontend;
use crate::error::CorpusError;

/// Map a corpus language code to an espeak-ng voice.
pub fn espeak_voice(language: &str) -> &str {
    match language {
        "en" => "en-us",
        "el" => "grc",
        "zh" => "cmn",
        "pt" => "pt-br",
        other => other,
    }
}

/// Phonemizes with espeak-ng and maps phones to articulatory features.
///
/// Punctuation that ends or splits a phrase is kept as its own token (when
/// the table has an entry for it) so pauses survive into the token sequence.
pub struct EspeakFrontend {
    table: FeatureTable,
    bin_path: Option<PathBuf>,
}

impl EspeakFrontend {
    /// Use `espeak-ng` from PATH.
    pub fn new(table: FeatureTable) -> Self {
        Self {
            table,
            bin_path: None,
        }
    }

    /// Use a bundled espeak-ng binary.
    pub fn with_binary(table: FeatureTable, bin_path: PathBuf) -> Self {
        Self {
            table,
            bin_path: Some(bin_path),
        }
    }

    /// Phone sequence for `text`, punctuation included.
    pub fn phonemize(&self, text: &str, language: &str) -> Result<Vec<char>, CorpusError> {
        let parts = split_text_parts(text);
        let segments: Vec<&str> = parts
            .iter()
            .filter_map(|part| match part {
                TextPart::Text(segment) => Some(segment.as_str()),
                TextPart::Punct(_) => None,
            })
            .collect();

        let segment_phones = if segments.is_empty() {
            Vec::new()
        } else {
            self.phonemize_segments_batch(&segments, espeak_voice(language))?
        };

        let mut phones = Vec::new();
        let mut segment_index = 0usize;
        for part in parts {
            match part {
                TextPart::Text(_) => {
                    if let Some(chunk) = segment_phones.get(segment_index) {
                        phones.extend_from_slice(chunk);
                    }
                    segment_index += 1;
                }
                TextPart::Punct(ch) => phones.push(ch),
            }
        }
        Ok(phones)
    }

    fn phonemize_segments_batch(
        &self,
        segments: &[&str],
        voice: &str,
    ) -> Result<Vec<Vec<char>>, CorpusError> {
        let output = self.run_espeak(&segments.join("\n"), voice)?;
        let lines: Vec<&str> = output.lines().collect();

        // espeak-ng emits one line per input line; fall back to one call per
        // segment when it does not.
        if lines.len() != segments.len() {
            return segments
                .iter()
                .map(|segment| Ok(ipa_to_phones(&self.run_espeak(segment, voice)?)))
                .collect();
        }
        Ok(lines.iter().map(|line| ipa_to_phones(line)).collect())
    }

    fn run_espeak(&self, input: &str, voice: &str) -> Result<String, CorpusError> {
        let bin = self
            .bin_path
            .as_deref()
            .map(|p| p.as_os_str())
            .unwrap_or_else(|| "espeak-ng".as_ref());
        let mut child = Command::new(bin)
            .args(["--ipa", "--stdin", "-q", "-v", voice])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CorpusError::EspeakNotFound
                } else {
                    CorpusError::Io(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(canonicalize_stdin_payload(input).as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorpusError::Frontend(format!(
                "espeak-ng exited with code {:?}: {stderr}",
                output.status.code()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TextFrontend for EspeakFrontend {
    fn tokenize(&self, transcript: &str, language: &str) -> Result<Array2<f32>, CorpusError> {
        let phones = self.phonemize(transcript, language)?;
        Ok(self.table.lookup(phones))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TextPart {
    Text(String),
    Punct(char),
}

fn split_text_parts(text: &str) -> Vec<TextPart> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for (idx, ch) in text.char_indices() {
        if let Some(punct) = map_boundary_punctuation(ch) {
            if !is_numeric_connector_between_digits(text, idx, ch) {
                flush_text_part(&mut parts, &mut current);
                parts.push(TextPart::Punct(punct));
                continue;
            }
        }

        if ch.is_whitespace() {
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            continue;
        }

        current.push(ch);
    }

    flush_text_part(&mut parts, &mut current);
    parts
}

fn flush_text_part(parts: &mut Vec<TextPart>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(TextPart::Text(trimmed.to_string()));
    }
    current.clear();
}

fn map_boundary_punctuation(ch: char) -> Option<char> {
    match ch {
        '.' | '!' | '?' | ',' | ';' | ':' => Some(ch),
        '—' | '…' => Some(','),
        '\n' | '\r' => Some('.'),
        _ => None,
    }
}

fn is_numeric_connector_between_digits(text: &str, idx: usize, ch: char) -> bool {
    if !matches!(ch, '.' | ',') {
        return false;
    }
    let prev = text[..idx].chars().next_back();
    let next = text[idx + ch.len_utf8()..].chars().next();
    matches!(
        (prev, next),
        (Some(left), Some(right)) if left.is_ascii_digit() && right.is_ascii_digit()
    )
}

/// espeak-ng reads stdin line by line and under-processes an unterminated
/// final line.
fn canonicalize_stdin_payload(input: &str) -> Cow<'_, str> {
    if input.ends_with('\n') {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(format!("{input}\n"))
    }
}

/// IPA output to phone characters, dropping espeak's tie markers and spaces.
fn ipa_to_phones(ipa: &str) -> Vec<char> {
    ipa.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .flat_map(|line| line.chars())
        .filter(|&ch| ch != '_' && !ch.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TOKEN_FEATURE_WIDTH;

    #[test]
    fn splits_text_and_punctuation_parts() {
        let parts = split_text_parts("Hallo, Welt. Test!");
        assert_eq!(
            parts,
            vec![
                TextPart::Text("Hallo".to_string()),
                TextPart::Punct(','),
                TextPart::Text("Welt".to_string()),
                TextPart::Punct('.'),
                TextPart::Text("Test".to_string()),
                TextPart::Punct('!'),
            ]
        );
    }

    #[test]
    fn keeps_decimal_separators_inside_text() {
        let parts = split_text_parts("Version 2.0 reached 1,000 users.");
        assert_eq!(
            parts,
            vec![
                TextPart::Text("Version 2.0 reached 1,000 users".to_string()),
                TextPart::Punct('.'),
            ]
        );
    }

    #[test]
    fn appends_trailing_newline_for_stdin() {
        assert_eq!(canonicalize_stdin_payload("America"), "America\n");
        assert_eq!(canonicalize_stdin_payload("America\n"), "America\n");
    }

    #[test]
    fn ipa_drops_ties_and_spaces() {
        assert_eq!(ipa_to_phones("h_ə l\n"), vec!['h', 'ə', 'l']);
    }

    #[test]
    fn tokenizes_to_table_width() {
        if Command::new("espeak-ng").arg("--version").output().is_err() {
            return;
        }
        let mut table = FeatureTable::default();
        for ch in "abdefhiklmnoprstuvwzæɑɔəɛɪʊʌŋθðʃʒɹɚɐɾː.,ˈˌ".chars() {
            table.insert(ch, vec![0.5; TOKEN_FEATURE_WIDTH]);
        }
        let tokens = EspeakFrontend::new(table)
            .tokenize("Hello world.", "en")
            .expect("espeak should succeed");
        assert_eq!(tokens.ncols(), TOKEN_FEATURE_WIDTH);
        assert!(tokens.nrows() > 3);
    }
}
