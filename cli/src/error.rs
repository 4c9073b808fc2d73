//! CLI error types

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No output found for process {0}")]
    NoOutput(u64),

    #[error(transparent)]
    Core(#[from] jpm_core::CoreError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CliError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CliError::InvalidArgument(_) => "CLI001",
            CliError::ConfigError(_) => "CLI002",
            CliError::NoOutput(_) => "CLI003",
            CliError::Core(e) => e.code(),
            CliError::IoError(_) => "CLI004",
        }
    }
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CliError::InvalidArgument("test".to_string()).code(), "CLI001");
        assert_eq!(CliError::ConfigError("test".to_string()).code(), "CLI002");
        assert_eq!(CliError::NoOutput(3).code(), "CLI003");
        assert_eq!(
            CliError::Core(jpm_core::CoreError::UnknownTask("x".to_string())).code(),
            "JPM008"
        );
    }

    #[test]
    fn test_error_display() {
        let error = CliError::InvalidArgument("--count must be at least 1".to_string());
        assert_eq!(error.to_string(), "Invalid argument: --count must be at least 1");

        let error = CliError::Core(jpm_core::CoreError::UnknownProcess(4));
        assert_eq!(error.to_string(), "Unknown process id: 4");
    }
}
