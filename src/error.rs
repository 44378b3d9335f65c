//! # Error Types
//!
//! Structured error hierarchy built on `thiserror`. Build-time failures that are
//! scoped to one document or one image never escape the encoder as errors; they
//! are logged and degrade to pass-through. The variants below cover what does
//! propagate: configuration problems, malformed payloads, and cipher failures.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the sealing toolchain.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum SealError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("image resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("unlock failed: {0}")]
    Unlock(#[from] UnlockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },
}

/// Why a single image reference could not be turned into bytes.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ResolveError {
    #[error("no local file found for '{src}' (tried: {tried:?})")]
    NotFound { src: String, tried: Vec<PathBuf> },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("gave up on {url} after {elapsed_ms}ms")]
    DeadlineExceeded { url: String, elapsed_ms: u128 },
}

impl ResolveError {
    /// Network errors and server-side statuses are worth another attempt;
    /// client errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResolveError::Network { .. } => true,
            ResolveError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: authentication tag mismatch (corrupted or wrong key)")]
    DecryptionFailed,

    #[error("invalid {field} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Malformed or undecodable payloads, rejected before key derivation.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload field '{0}' is empty")]
    EmptyField(String),

    #[error("payload field '{field}' must decode to {expected} bytes, got {actual}")]
    FieldLength {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("payload iteration count must be positive")]
    ZeroIterations,

    #[error(
        "payload iteration count {0} exceeds the maximum of {max}",
        max = crate::crypto::MAX_ITERATIONS
    )]
    TooManyIterations(u32),

    #[error("slug '{0}' cannot be used in a payload path")]
    UnsafeSlug(String),

    #[error("payload URL '{0}' has no path to publish under")]
    UnservableUrl(String),

    #[error("image '{0}' has no mime type")]
    MissingMime(String),
}

/// Failures surfaced to the reader at the unlock prompt.
///
/// The `Display` text is exactly what the widget shows. Wrong passwords and
/// corrupted payloads share one message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnlockError {
    #[error("Please enter a password.")]
    EmptyPassword,

    #[error("Configuration error: No payload found.")]
    NoPayload,

    #[error("Unlock already in progress.")]
    Busy,

    #[error("Failed to load content. Please check your connection.")]
    Transport,

    #[error("Incorrect password or decryption failed.")]
    Decryption,
}

pub type Result<T> = std::result::Result<T, SealError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retried() {
        let not_found = ResolveError::Status {
            url: "https://example.com/a.png".into(),
            status: 404,
        };
        let unavailable = ResolveError::Status {
            url: "https://example.com/a.png".into(),
            status: 503,
        };
        assert!(!not_found.is_retryable());
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn unlock_messages_do_not_distinguish_cause() {
        assert_eq!(
            UnlockError::Decryption.to_string(),
            "Incorrect password or decryption failed."
        );
    }
}
