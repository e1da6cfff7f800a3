//! Error types shared by every API family of the client.
//!
//! All wire-facing operations funnel their failures into [`ApiError`], which
//! carries enough context (URL, status, path) for debugging and drives the
//! retry pipeline's two classification questions:
//!
//! - [`ApiError::should_retry`] - is another attempt worth making?
//! - [`ApiError::should_punish`] - should the host that served this attempt
//!   be penalised in its selector?
//!
//! # Classification
//!
//! | Error | Retry | Punish |
//! |-------|-------|--------|
//! | Transport (no response) | yes | yes |
//! | Timeout | yes | yes |
//! | HTTP 5xx | yes | yes |
//! | HTTP 509 (rate limited) | yes | yes |
//! | MD5 mismatch (synthetic 406) | yes | no |
//! | HTTP 4xx (other) | no | no |
//! | Cancelled | no | no |
//! | Local IO / invalid input | no | no |

use std::path::PathBuf;

use thiserror::Error;

/// Synthetic status code assigned to a per-part MD5 mismatch.
pub const STATUS_MD5_MISMATCH: u16 = 406;

/// Status code the service uses for rate limiting.
pub const STATUS_RATE_LIMITED: u16 = 509;

/// Errors that can occur while talking to the object-storage service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS resolution, connection refused, TLS, etc.)
    /// where no HTTP response was received.
    #[error("transport error calling {url}: {source}")]
    Transport {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout calling {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors and the
    /// service-specific codes such as 509, 612, 614, 579).
    #[error("HTTP {status} calling {url}")]
    Status {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The MD5 the server reported for an uploaded part does not match the
    /// locally computed digest. Carries the synthetic status 406.
    #[error("md5 not match for part {part_number}: local {local}, remote {remote}")]
    Md5Mismatch {
        /// 1-based part number.
        part_number: usize,
        /// Hex MD5 computed over the bytes that were sent.
        local: String,
        /// Hex MD5 the server reported.
        remote: String,
    },

    /// The response arrived but its shape was not usable (undecodable JSON,
    /// missing required header, empty host list from discovery).
    #[error("unexpected response from {url}: {detail}")]
    UnexpectedResponse {
        /// The URL that answered.
        url: String,
        /// What was wrong with the answer.
        detail: String,
    },

    /// File system error while reading a source or writing a destination.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The caller supplied input the operation cannot work with.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// No host is available for the requested service class.
    #[error("no {service} host available")]
    NoHost {
        /// Service class (up, io, rs, rsf, uc, monitor).
        service: &'static str,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

impl ApiError {
    /// Creates a transport error from a reqwest error, promoting timeouts
    /// to [`ApiError::Timeout`].
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Transport { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    /// Creates an unexpected-response error.
    pub fn unexpected(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Returns the HTTP status code this error maps to, if any.
    ///
    /// MD5 mismatches map to the synthetic 406 the service itself would use.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Md5Mismatch { .. } => Some(STATUS_MD5_MISMATCH),
            _ => None,
        }
    }

    /// Returns true when another attempt against a (possibly different) host
    /// is worth making: transport-level failures and 5xx responses.
    ///
    /// 4xx responses are terminal (the request itself is at fault) and
    /// cancellation is never retried.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status / 100 == 5,
            Self::Md5Mismatch { .. } => true,
            Self::Cancelled
            | Self::Io { .. }
            | Self::InvalidInput { .. }
            | Self::NoHost { .. }
            | Self::UnexpectedResponse { .. } => false,
        }
    }

    /// Returns true when the host that served this attempt should be
    /// punished in its selector: 5xx responses and transport errors.
    ///
    /// MD5 mismatches are retried but not held against the host.
    #[must_use]
    pub fn should_punish(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status / 100 == 5,
            _ => false,
        }
    }

    /// Returns true for cancellation, which must be propagated unchanged.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
