use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Fetch Error: {0}")]
    Fetch(String),
    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Integrity Error: {}:{line} {reason}", .file.display())]
    IntegrityLine {
        file: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Integrity Error: record count mismatch, expected {expected}, found {found}")]
    IntegrityCount { expected: usize, found: usize },

    #[error("Csv Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Config Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Run interrupted after writing {written} records")]
    Interrupted { written: usize },
}

impl Error {
    /// The output on disk is corrupt or incomplete, as opposed to unreachable.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::IntegrityLine { .. } | Error::IntegrityCount { .. }
        )
    }
}
