//! Error types for caption rendering.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// How an engine failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineFailureKind {
    /// Too many open files, oversized filter graph, temporary unavailability.
    /// Retried with a smaller batch.
    Resource,
    /// Segfault-like crash. Retried with a simpler filter, then without overlays.
    Crash,
    /// Anything else. Not retried.
    Other,
}

impl fmt::Display for EngineFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineFailureKind::Resource => "resource",
            EngineFailureKind::Crash => "crash",
            EngineFailureKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while rendering captions into a video.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("FFprobe not found: {0}")]
    FfprobeNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timing inconsistency: {0}")]
    TimingInconsistency(String),

    #[error("FFmpeg {kind} failure: {message}")]
    EngineFailed {
        kind: EngineFailureKind,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Output validation failed for {path}: {reason}")]
    OutputValidation { path: PathBuf, reason: String },

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Font error: {0}")]
    Font(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stderr fragments that indicate resource exhaustion.
const RESOURCE_SIGNATURES: &[&str] = &[
    "too many open files",
    "emfile",
    "resource temporarily unavailable",
    "cannot allocate memory",
    "argument list too long",
    "filter graph too large",
    "too many inputs",
];

/// Stderr fragments that indicate an engine crash.
const CRASH_SIGNATURES: &[&str] = &[
    "segmentation fault",
    "sigsegv",
    "core dumped",
    "bus error",
    "illegal instruction",
    "hwupload",
    "impossible to convert between the formats",
    "failed to configure output pad",
    "error reinitializing filters",
];

/// Unix exit statuses of processes killed by SIGSEGV/SIGBUS/SIGILL/SIGABRT.
const CRASH_EXIT_CODES: &[i32] = &[132, 134, 135, 139, -11, -6];

impl MediaError {
    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a timing inconsistency error.
    pub fn timing(message: impl Into<String>) -> Self {
        Self::TimingInconsistency(message.into())
    }

    /// Create an engine failure, classifying it from stderr and exit code.
    pub fn engine_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        let kind = classify_failure(stderr.as_deref(), exit_code);
        Self::EngineFailed {
            kind,
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an output validation error.
    pub fn output_invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::OutputValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a font error.
    pub fn font(message: impl Into<String>) -> Self {
        Self::Font(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediaError::Cancelled)
    }

    /// Whether a smaller batch might succeed.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            MediaError::EngineFailed { kind, .. } => *kind == EngineFailureKind::Resource,
            MediaError::Io(e) => e.raw_os_error() == Some(24) || e.raw_os_error() == Some(7),
            _ => false,
        }
    }

    /// Whether a simpler filter graph might succeed.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            MediaError::EngineFailed {
                kind: EngineFailureKind::Crash,
                ..
            }
        )
    }

    /// Whether internal phases may retry with adjusted parameters.
    pub fn is_retryable(&self) -> bool {
        self.is_resource_exhaustion() || self.is_crash()
    }
}

/// Classify an engine failure from its stderr text and exit status.
pub fn classify_failure(stderr: Option<&str>, exit_code: Option<i32>) -> EngineFailureKind {
    let text = stderr.unwrap_or_default().to_lowercase();

    if RESOURCE_SIGNATURES.iter().any(|sig| text.contains(sig)) {
        return EngineFailureKind::Resource;
    }
    if CRASH_SIGNATURES.iter().any(|sig| text.contains(sig)) {
        return EngineFailureKind::Crash;
    }
    if let Some(code) = exit_code {
        if CRASH_EXIT_CODES.contains(&code) {
            return EngineFailureKind::Crash;
        }
    }
    EngineFailureKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_resource() {
        let kind = classify_failure(Some("[in_42] Too many open files"), Some(1));
        assert_eq!(kind, EngineFailureKind::Resource);
    }

    #[test]
    fn test_classify_crash() {
        assert_eq!(
            classify_failure(Some("Segmentation fault (core dumped)"), Some(139)),
            EngineFailureKind::Crash
        );
        assert_eq!(classify_failure(None, Some(139)), EngineFailureKind::Crash);
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(
            classify_failure(Some("No such file or directory"), Some(1)),
            EngineFailureKind::Other
        );
    }

    #[test]
    fn test_error_predicates() {
        let err = MediaError::engine_failed("x", Some("too many open files".into()), Some(1));
        assert!(err.is_resource_exhaustion());
        assert!(err.is_retryable());
        assert!(!err.is_crash());

        assert!(MediaError::Cancelled.is_cancelled());
        assert!(!MediaError::Cancelled.is_retryable());

        let emfile = MediaError::Io(std::io::Error::from_raw_os_error(24));
        assert!(emfile.is_resource_exhaustion());
    }
}
