use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ForgeError {
    #[error("failed to load {what} from {path}")]
    SpecLoad {
        what: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    SpecParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("libvirt error: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {seconds}s waiting for {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("operation cancelled while {operation}")]
    Cancelled { operation: String },

    #[error("image download failed: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ForgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        ForgeError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ForgeError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error is a typed "not found" condition. Existence checks
    /// use this to map lookup misses to `false` instead of propagating.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ForgeError::NotFound { .. })
    }
}
