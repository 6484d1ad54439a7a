//! Error types for quantforge.
//!
//! One enum covers every boundary in the system: Hub traffic, the catalog
//! store, subprocess invocations, and local filesystem work. Variants map
//! onto the retry and failure policies of the pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the quantforge library.
#[derive(Debug, Error)]
pub enum ForgeError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Catalog store errors
    #[error("Catalog error: {message}")]
    Catalog {
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    #[error("Model not found in catalog: {model_id}")]
    ModelNotFound { model_id: String },

    // Hub errors
    #[error("Hub API error: {message}")]
    Hub {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Repository not found: {repo_id}")]
    RepoNotFound { repo_id: String },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Upload failed for {path}: {message}")]
    UploadFailed { path: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Disk pressure
    #[error("Insufficient disk space for {model_id}: need {needed_gib:.1} GiB, have {free_gib:.1} GiB")]
    InsufficientSpace {
        model_id: String,
        needed_gib: f64,
        free_gib: f64,
    },

    #[error("Disk space exhausted for {model_id}: reclamation freed too little")]
    SpaceExhausted { model_id: String },

    // Pipeline errors
    #[error("Conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("Quantization failed for {quant}: {message}")]
    QuantizeFailed { quant: String, message: String },

    #[error("Importance matrix acquisition failed: {message}")]
    ImatrixFailed { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Contract violations (malformed rule file, quant-config file, manifest)
    #[error("Invalid {what}: {message}")]
    Contract { what: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for quantforge operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

// Conversion implementations for common error types

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        ForgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<redis::RedisError> for ForgeError {
    fn from(err: redis::RedisError) -> Self {
        ForgeError::Catalog {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ForgeError::Timeout(std::time::Duration::from_secs(0))
        } else {
            ForgeError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl ForgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ForgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient-infra kinds qualify; everything else surfaces upward.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForgeError::Network { .. } | ForgeError::Timeout(_) => true,
            ForgeError::Hub { status_code, .. } => {
                matches!(status_code, Some(429) | Some(500..=599))
            }
            ForgeError::Catalog { source, .. } => source
                .as_ref()
                .map(|e| e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped())
                .unwrap_or(false),
            _ => false,
        }
    }
}
