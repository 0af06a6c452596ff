use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum UnlockError {
    #[error("invalid title id: {0}")]
    InvalidTitleId(String),

    #[error("invalid file hint: {0}")]
    InvalidHint(String),

    #[error("missing config file depot-unlock.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing config setting: {0}")]
    MissingSetting(String),

    #[error("invalid config setting {name}: {message}")]
    InvalidSetting { name: String, message: String },

    #[error("GitHub request failed: {0}")]
    GithubHttp(String),

    #[error("GitHub returned status {status}: {message}")]
    GithubStatus { status: u16, message: String },

    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error("git command timed out after {0}s")]
    GitTimeout(u64),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("external downloader failed: {0}")]
    External(String),

    #[error("invalid key file: {0}")]
    KeyFile(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl UnlockError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UnlockError::GithubStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
