//! Error types for configuration loading.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        /// Path of the file being read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The configuration document is not valid YAML for the schema.
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A field holds a value outside its permitted range.
    #[error("Invalid configuration for {field}: {message}")]
    Invalid {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an [`ConfigError::Invalid`] error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_display() {
        let err = ConfigError::invalid("pm.total_images", "must be at least 2");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for pm.total_images: must be at least 2"
        );
    }
}
