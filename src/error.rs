//! Pipeline error taxonomy and the aggregated run-level failure report.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that fail one seed (or the run before any seed is attempted).
///
/// Candidate rejection by the acceptance gate is not an error; see
/// [`crate::image_validator::Verdict`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no search results found for {query}")]
    NotFound { query: String },
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("no descriptive sentences found for {name}")]
    NoContent { name: String },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid seed file: {0}")]
    SeedFormat(String),
    #[error("document cache error: {0}")]
    Cache(#[from] rusqlite::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One seed that could not be processed, with its cause.
#[derive(Debug)]
pub struct SeedFailure {
    pub scientific_name: String,
    pub common_name: String,
    pub cause: PipelineError,
}

/// Raised once at the end of a run when at least one seed failed.
#[derive(Debug)]
pub struct RunFailure {
    pub failures: Vec<SeedFailure>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Some animals failed to process:")?;
        for failure in &self.failures {
            write!(
                f,
                "\n{} ({}): {}",
                failure.scientific_name, failure.common_name, failure.cause
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {}
