use std::path::PathBuf;
use thiserror::Error;

/// Maximum number of bytes of subprocess output embedded in an error or log line.
pub const DIAGNOSTIC_EXCERPT_BYTES: usize = 4000;

#[derive(Debug, Error)]
pub enum StemError {
    #[error("audio file not found: {}", .path.display())]
    InputMissing { path: PathBuf },

    #[error("failed to start separation process '{program}': {source}")]
    ProcessSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("separation process timed out after {elapsed_ms} ms")]
    ProcessTimeout { elapsed_ms: u128 },

    #[error("separation process failed (code {})\nstderr: {stderr}\nstdout: {stdout}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    ProcessExitedNonZero {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("generated stems missing in {}: found [{}]", .dir.display(), .listing.join(", "))]
    OutputFilesMissing { dir: PathBuf, listing: Vec<String> },

    #[error("separation cancelled")]
    Cancelled,

    #[error("stem separator not initialized")]
    NotInitialized,

    #[error("pipeline construction failed: {0}")]
    GraphConstruction(String),

    #[error("invalid transport operation: {0}")]
    TransportState(String),

    #[error("audio sink error: {0}")]
    Sink(String),

    #[error("failed to decode '{}': {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Coarse failure category surfaced to callers alongside the reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Input,
    Process,
    Timeout,
    OutputValidation,
    Cancelled,
    GraphConstruction,
    TransportState,
    Internal,
}

impl StemError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StemError::InputMissing { .. } => ErrorClass::Input,
            StemError::ProcessSpawnFailed { .. } | StemError::ProcessExitedNonZero { .. } => {
                ErrorClass::Process
            }
            StemError::ProcessTimeout { .. } => ErrorClass::Timeout,
            StemError::OutputFilesMissing { .. } => ErrorClass::OutputValidation,
            StemError::Cancelled => ErrorClass::Cancelled,
            StemError::GraphConstruction(_) | StemError::Decode { .. } | StemError::Sink(_) => {
                ErrorClass::GraphConstruction
            }
            StemError::TransportState(_) | StemError::NotInitialized => ErrorClass::TransportState,
            StemError::Config(_)
            | StemError::Io(_)
            | StemError::Json(_)
            | StemError::Anyhow(_) => ErrorClass::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StemError>;

/// Most recent failure, kept for callers that only get a `bool` or an id back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&StemError> for LastError {
    fn from(err: &StemError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Cut `text` down to at most `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_excerpt(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_respects_char_boundaries() {
        let s = "ab€cd";
        // '€' is 3 bytes starting at index 2
        assert_eq!(truncate_excerpt(s, 3), "ab");
        assert_eq!(truncate_excerpt(s, 5), "ab€");
        assert_eq!(truncate_excerpt(s, 100), s);
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            StemError::InputMissing { path: "x".into() }.class(),
            ErrorClass::Input
        );
        assert_eq!(StemError::ProcessTimeout { elapsed_ms: 1 }.class(), ErrorClass::Timeout);
        assert_eq!(
            StemError::OutputFilesMissing { dir: "d".into(), listing: vec![] }.class(),
            ErrorClass::OutputValidation
        );
        assert_eq!(StemError::Cancelled.class(), ErrorClass::Cancelled);
        assert_eq!(
            StemError::TransportState("idle".into()).class(),
            ErrorClass::TransportState
        );
    }
}
