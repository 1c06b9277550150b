//! Error types for the refstore client.
//!
//! This module defines structured errors for all client operations.
//! Client-side precondition violations (`MissingCredentials`,
//! `ParamNotPassed`, `TooManyItems`) are raised before any network or file
//! I/O happens. Server-reported failures carry the status, method, URL and
//! response body of the offending exchange for diagnosis.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Context captured from a completed server exchange that failed.
///
/// Attached to every status-code-driven error variant so callers can log
/// or display exactly which request went wrong and what the server said.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// The HTTP status code the server returned.
    pub status: u16,
    /// The request method.
    pub method: String,
    /// The final request URL.
    pub url: String,
    /// The response body, decoded as text.
    pub body: String,
}

impl fmt::Display for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTP {} from {} {}: {}",
            self.status, self.method, self.url, self.body
        )
    }
}

/// Errors that can occur while talking to the reference-library service.
#[derive(Debug, Error)]
pub enum Error {
    /// The client was constructed without the credentials it needs.
    #[error("missing credentials: {reason}")]
    MissingCredentials {
        /// What was missing.
        reason: String,
    },

    /// A required parameter was absent from a payload or call.
    #[error("required parameter not passed: {param}")]
    ParamNotPassed {
        /// Name of the missing parameter.
        param: String,
    },

    /// More items were submitted than the server accepts in one call.
    #[error("{count} items submitted, but the limit is {limit} per call")]
    TooManyItems {
        /// How many items were submitted.
        count: usize,
        /// The per-call ceiling.
        limit: usize,
    },

    /// The server rejected the request parameters (HTTP 400).
    #[error("invalid or unsupported parameters ({context})")]
    UnsupportedParams {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// The API key does not grant access to this resource (HTTP 401/403).
    #[error("user not authorised ({context})")]
    UserNotAuthorised {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// The requested resource does not exist (HTTP 404).
    #[error("resource not found ({context})")]
    ResourceNotFound {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// The target library is locked by another write (HTTP 409).
    #[error("conflict ({context})")]
    Conflict {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// A supplied version header did not match the server state (HTTP 412).
    #[error("precondition failed ({context})")]
    PreConditionFailed {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// The upload or payload exceeds the server's size limit (HTTP 413).
    #[error("request entity too large ({context})")]
    RequestEntityTooLarge {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// A version header is required but was not supplied (HTTP 428).
    #[error("precondition required ({context})")]
    PreConditionRequired {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// The server kept rate-limiting past the backoff ceiling.
    #[error(
        "still receiving HTTP 429 after waiting {waited_units} delay units; \
         you are being rate-limited, try again later"
    )]
    TooManyRetries {
        /// Total delay units slept before giving up.
        waited_units: u64,
    },

    /// Any error status outside the mapped set.
    #[error("unexpected HTTP response ({context})")]
    Http {
        /// The failed exchange.
        context: ResponseContext,
    },

    /// Transport-level failure before a response was received.
    #[error("network error during {method} {url}: {source}")]
    Network {
        /// The request method.
        method: String,
        /// The request URL.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// A file referenced by an upload batch is missing or unreadable.
    #[error("the file at {path} could not be opened or found")]
    FileDoesNotExist {
        /// The offending path.
        path: PathBuf,
    },

    /// Local filesystem failure while reading upload content.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file changed size between measurement and read during body
    /// assembly. Surfaced loudly since a short or long body would corrupt
    /// the multipart boundary framing around it.
    #[error("size mismatch assembling {path}: measured {expected} bytes, read {actual}")]
    SizeMismatch {
        /// The file being assembled.
        path: PathBuf,
        /// Size measured before the read.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// The server returned a body that could not be parsed as expected.
    #[error("unparseable response body from {url}: {reason}")]
    UnexpectedResponse {
        /// The request URL.
        url: String,
        /// Why parsing failed.
        reason: String,
    },
}

impl Error {
    /// Creates a missing-credentials error.
    pub fn missing_credentials(reason: impl Into<String>) -> Self {
        Self::MissingCredentials {
            reason: reason.into(),
        }
    }

    /// Creates a missing-parameter error.
    pub fn param_not_passed(param: impl Into<String>) -> Self {
        Self::ParamNotPassed {
            param: param.into(),
        }
    }

    /// Creates a too-many-items error.
    pub fn too_many_items(count: usize, limit: usize) -> Self {
        Self::TooManyItems { count, limit }
    }

    /// Creates a network error.
    pub fn network(method: impl Into<String>, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            method: method.into(),
            url: url.into(),
            source,
        }
    }

    /// Creates a missing-file error.
    pub fn file_does_not_exist(path: impl Into<PathBuf>) -> Self {
        Self::FileDoesNotExist { path: path.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a size-mismatch error.
    pub fn size_mismatch(path: impl Into<PathBuf>, expected: u64, actual: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected,
            actual,
        }
    }

    /// Creates an unexpected-response error.
    pub fn unexpected_response(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

// Note on From trait implementations:
// We intentionally do NOT implement `From<reqwest::Error>` or
// `From<std::io::Error>` because our variants require context (method, url,
// path) that the source errors don't provide. The helper constructors are
// the pattern callers should use instead.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_response_context_display() {
        let context = ResponseContext {
            status: 412,
            method: "PUT".to_string(),
            url: "https://api.refstore.org/users/1/items/ABC".to_string(),
            body: "version mismatch".to_string(),
        };
        let msg = context.to_string();
        assert!(msg.contains("412"), "expected status in: {msg}");
        assert!(msg.contains("PUT"), "expected method in: {msg}");
        assert!(msg.contains("/users/1/items/ABC"), "expected URL in: {msg}");
        assert!(msg.contains("version mismatch"), "expected body in: {msg}");
    }

    #[test]
    fn test_too_many_items_display() {
        let error = Error::too_many_items(51, 50);
        let msg = error.to_string();
        assert!(msg.contains("51"), "expected count in: {msg}");
        assert!(msg.contains("50"), "expected limit in: {msg}");
    }

    #[test]
    fn test_too_many_retries_display() {
        let error = Error::TooManyRetries { waited_units: 62 };
        let msg = error.to_string();
        assert!(msg.contains("429"), "expected 429 in: {msg}");
        assert!(msg.contains("62"), "expected waited units in: {msg}");
    }

    #[test]
    fn test_size_mismatch_display() {
        let error = Error::size_mismatch("/tmp/a.pdf", 100, 40);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/a.pdf"), "expected path in: {msg}");
        assert!(msg.contains("100"), "expected measured size in: {msg}");
        assert!(msg.contains("40"), "expected read size in: {msg}");
    }

    #[test]
    fn test_file_does_not_exist_display() {
        let error = Error::file_does_not_exist("/tmp/missing.pdf");
        let msg = error.to_string();
        assert!(msg.contains("/tmp/missing.pdf"), "expected path in: {msg}");
    }

    #[test]
    fn test_param_not_passed_display() {
        let error = Error::param_not_passed("version");
        assert!(error.to_string().contains("version"));
    }
}
