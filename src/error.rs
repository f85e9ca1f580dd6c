use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Library error types
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to fetch source {source_name}: {reason}")]
    SourceFetch { source_name: String, reason: String },

    #[error("line {line_no}: cannot parse source entry: {line}")]
    SourceParse { line_no: usize, line: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no candidate addresses obtained from any source")]
    NoCandidates,

    #[error("cannot create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },

    #[error("cannot parse result line: {0}")]
    ResultParse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ScanError {
    pub fn fetch(source_name: &str, reason: impl ToString) -> Self {
        ScanError::SourceFetch {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Fatal errors abort a run; everything else is logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::NoCandidates | ScanError::OutputDir { .. } | ScanError::Config(_)
        )
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
