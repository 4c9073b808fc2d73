//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Process {0} was already started")]
    AlreadyStarted(u64),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown process id: {0}")]
    UnknownProcess(u64),

    #[error("Identifier allocator error: {0}")]
    Allocator(String),

    #[error("Task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "JPM001",
            CoreError::ValidationError(_) => "JPM002",
            CoreError::InitializationError(_) => "JPM003",
            CoreError::ProcessSpawn(_) => "JPM004",
            CoreError::ProcessSignal(_) => "JPM005",
            CoreError::ProcessWait(_) => "JPM006",
            CoreError::AlreadyStarted(_) => "JPM007",
            CoreError::UnknownTask(_) => "JPM008",
            CoreError::Allocator(_) => "JPM009",
            CoreError::IoError(_) => "JPM010",
            CoreError::SerializationError(_) => "JPM011",
            CoreError::TaskFailed { .. } => "JPM012",
            CoreError::UnknownProcess(_) => "JPM013",
            CoreError::Other(_) => "JPM999",
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub(crate) fn io_at(path: &std::path::Path, action: &str, e: std::io::Error) -> Self {
        CoreError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to {} {}: {}", action, path.display(), e),
        ))
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::ConfigurationError("test".to_string()).code(), "JPM001");
        assert_eq!(CoreError::ValidationError("test".to_string()).code(), "JPM002");
        assert_eq!(CoreError::ProcessSpawn("test".to_string()).code(), "JPM004");
        assert_eq!(CoreError::AlreadyStarted(3).code(), "JPM007");
        assert_eq!(CoreError::UnknownTask("x".to_string()).code(), "JPM008");
        assert_eq!(
            CoreError::TaskFailed {
                task: "fail".to_string(),
                message: "boom".to_string()
            }
            .code(),
            "JPM012"
        );
        assert_eq!(CoreError::Other("test".to_string()).code(), "JPM999");
    }

    #[test]
    fn test_error_display() {
        let error = CoreError::AlreadyStarted(12);
        assert_eq!(error.to_string(), "Process 12 was already started");
    }

    #[test]
    fn test_from_implementations() {
        let error: CoreError = "test error".into();
        assert_eq!(error.to_string(), "Generic error: test error");

        let error: CoreError = "test error".to_string().into();
        assert_eq!(error.to_string(), "Generic error: test error");
    }
}
