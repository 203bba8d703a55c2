use thiserror::Error;

/// Core error types for netpolc
///
/// These are hard failures of the compiler itself (unreadable input,
/// malformed model, unwritable output). Policy findings are reported as
/// [`crate::core::diag::Diagnostic`] values instead.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Policy model references are missing or inconsistent
    #[error("Import error in {object}: {message}")]
    Import { object: String, message: String },

    /// Compiler configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Writing device configuration failed
    #[error("Emission error for {device}: {message}")]
    Emit { device: String, message: String },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn import(object: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Import {
            object: object.into(),
            message: message.into(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl Error {
    /// Returns a user-facing message with hints for the most common failures.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorTranslation::new(format!("File not found: {e}"))
                    .with_suggestion("Check the path to the policy model")
                    .with_suggestion("Relative paths are resolved from the current directory")
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorTranslation::new(format!("Permission denied: {e}"))
                    .with_suggestion("Ensure the output directory is writable")
            }
            Error::Serialization(e) => ErrorTranslation::new(format!("Malformed JSON: {e}"))
                .with_suggestion("Validate the model file with a JSON linter")
                .with_suggestion("Unknown fields are rejected, check for typos"),
            Error::Import { object, message } => {
                ErrorTranslation::new(format!("Invalid policy model at {object}: {message}"))
                    .with_suggestion("References use the form type:name, e.g. network:dmz")
                    .with_suggestion("Every referenced object must be defined exactly once")
            }
            Error::Config(message) => {
                ErrorTranslation::new(format!("Invalid configuration: {message}"))
                    .with_suggestion("Check levels are one of: no, warn, err")
            }
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
