//! Worker error types.

use std::path::PathBuf;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to read request {path}: {source}")]
    RequestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid request {path}: {source}")]
    RequestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Metrics exporter failed: {0}")]
    Metrics(String),

    #[error("Media error: {0}")]
    Media(#[from] capburn_media::MediaError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether the render was stopped by a cancel request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Media(e) if e.is_cancelled())
    }

    /// Process exit code for this failure.
    ///
    /// 130 mirrors the shell convention for SIGINT.
    pub fn exit_code(&self) -> i32 {
        match self {
            _ if self.is_cancelled() => 130,
            WorkerError::ConfigError(_)
            | WorkerError::RequestRead { .. }
            | WorkerError::RequestParse { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capburn_media::MediaError;

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerError::from(MediaError::Cancelled).exit_code(), 130);
        assert_eq!(WorkerError::config_error("bad").exit_code(), 2);
        assert_eq!(
            WorkerError::from(MediaError::invalid_input("no video")).exit_code(),
            1
        );
    }

    #[test]
    fn test_is_cancelled() {
        assert!(WorkerError::from(MediaError::Cancelled).is_cancelled());
        assert!(!WorkerError::Metrics("bind".into()).is_cancelled());
    }
}
