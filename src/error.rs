use std::{io, path::PathBuf};
use thiserror::Error;

/// Failures reported by the external archive tool.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive tool not found: {}", .0.display())]
    ToolNotFound(PathBuf),

    #[error("archive is encrypted, key required: {}", .0.display())]
    EncryptionKeyRequired(PathBuf),

    /// Raw stderr of the tool, kept verbatim.
    #[error("{stderr}")]
    Failed { stderr: String },

    #[error("failed to launch archive tool: {0}")]
    Launch(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn is_key_required(&self) -> bool {
        matches!(self, ArchiveError::EncryptionKeyRequired(_))
    }
}

/// Failures launching the external merge tool. A tool that runs and exits
/// non-zero is not an error here; callers inspect the exit code.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge tool not found: {0}")]
    ToolNotFound(String),

    #[error("merge tool takes 1 to 3 inputs, got {0}")]
    InputCount(usize),

    #[error("failed to launch merge tool: {0}")]
    Launch(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Conditions that end a processing run as a whole.
#[derive(Debug, Error)]
pub enum RunAbort {
    #[error("archive tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("cancelled: no destination directory chosen")]
    Cancelled,

    #[error("merge directory empty - you must save before closing the merge tool")]
    StagingEmpty,

    #[error("pack failed: {0}")]
    PackFailed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl RunAbort {
    pub fn code(&self) -> &'static str {
        match self {
            RunAbort::ToolUnavailable(_) => "TOOL_UNAVAILABLE",
            RunAbort::Cancelled => "CANCELLED",
            RunAbort::StagingEmpty => "STAGING_EMPTY",
            RunAbort::PackFailed(_) => "PACK_FAILED",
            RunAbort::Io(_) => "IO_ERROR",
        }
    }

    /// A cancelled run is a deliberate user choice, not a failure.
    pub fn is_error(&self) -> bool {
        !matches!(self, RunAbort::Cancelled)
    }
}

impl From<io::Error> for RunAbort {
    fn from(err: io::Error) -> Self {
        RunAbort::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_displays_stderr_verbatim() {
        let err = ArchiveError::Failed {
            stderr: "Error: bad magic at 0x10".to_string(),
        };
        assert_eq!(err.to_string(), "Error: bad magic at 0x10");
    }

    #[test]
    fn cancel_is_not_an_error() {
        assert!(!RunAbort::Cancelled.is_error());
        assert!(RunAbort::StagingEmpty.is_error());
        assert_eq!(RunAbort::PackFailed("x".into()).code(), "PACK_FAILED");
    }
}
