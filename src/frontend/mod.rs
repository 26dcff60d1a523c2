//! Text frontends turn a transcript into token feature rows.
//!
//! The pipeline only relies on [`TextFrontend`]; [`EspeakFrontend`] is a
//! ready-made implementation that phonemizes with espeak-ng and looks each
//! phone up in an articulatory feature table.
//!
//! # System Requirements
//!
//! [`EspeakFrontend`] needs **espeak-ng** on the system:
//! - **Linux**: `sudo apt-get install espeak-ng`
//! - **macOS**: `brew install espeak-ng`
//! - **Windows**: Download installer from <https://espeak-ng.org/download>

pub mod espeak;
pub mod table;

use ndarray::Array2;

use crate::error::CorpusError;

pub use espeak::EspeakFrontend;
pub use table::FeatureTable;

pub trait TextFrontend {
    /// Token feature rows `[tokens x TOKEN_FEATURE_WIDTH]` for `transcript`.
    fn tokenize(&self, transcript: &str, language: &str) -> Result<Array2<f32>, CorpusError>;
}
