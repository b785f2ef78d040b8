//! Error taxonomy for suite runs

use crate::readiness::ReadinessError;

/// Errors produced while running a suite
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("Readiness wait failed for '{name}': {source}")]
    ReadinessTimeout {
        name: String,
        #[source]
        source: ReadinessError,
    },

    #[error("Failed to spawn '{name}': {source}")]
    ProcessSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Log capture failed for '{name}': {message}")]
    ProcessIo { name: String, message: String },

    #[error("Service '{name}' exited with code {}", display_code(.code))]
    ServiceExit { name: String, code: Option<i32> },

    #[error("Test runner exited with code {}", display_code(.code))]
    TestFailure { code: Option<i32> },

    #[error("Before command exited with code {}", display_code(.code))]
    BeforeFailed { code: Option<i32> },

    #[error("Compose command failed: {0}")]
    Compose(String),

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("Suite '{suite}' aborted: {source}")]
    SuiteAbort {
        suite: String,
        #[source]
        source: Box<SuiteError>,
    },
}

impl SuiteError {
    /// The error that started the abort, looking through `SuiteAbort`
    pub fn root(&self) -> &SuiteError {
        match self {
            SuiteError::SuiteAbort { source, .. } => source.root(),
            other => other,
        }
    }
}

pub(crate) fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "null".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SuiteError>;
