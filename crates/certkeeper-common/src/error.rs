//! Error types for certkeeper
//!
//! Errors carry the object or path they relate to so a log line alone is
//! enough to see what failed. Parse failures of stored material never show up
//! here: the reconciler recovers from them by regenerating.

use std::path::PathBuf;
use std::time::Duration;

use certkeeper_pki::PkiError;
use thiserror::Error;

/// Main error type for certkeeper operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Certificate generation failed (key generation, randomness or signing)
    #[error("certificate generation failed: {source}")]
    Generation {
        /// The underlying PKI error
        #[from]
        source: PkiError,
    },

    /// Writing an object back to the API server failed
    #[error("failed to persist {resource}: {message}")]
    Persistence {
        /// Object that could not be written (e.g. "secret operators/webhook")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// The API group serving webhook configurations is missing
    #[error("could not find api group {group:?}")]
    UnsupportedApi {
        /// Group that was looked up
        group: String,
    },

    /// A file watch could not be (re-)established
    #[error("failed to watch {}: {message}", path.display())]
    WatchEstablish {
        /// Watched path
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Reading a local file failed
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A bounded call did not finish in time
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a persistence error for `resource`
    pub fn persistence(resource: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Persistence {
            resource: resource.into(),
            message: msg.to_string(),
        }
    }

    /// Create an unsupported API error for `group`
    pub fn unsupported_api(group: impl Into<String>) -> Self {
        Self::UnsupportedApi {
            group: group.into(),
        }
    }

    /// Create a watch establishment error for `path`
    pub fn watch_establish(path: impl Into<PathBuf>, msg: impl std::fmt::Display) -> Self {
        Self::WatchEstablish {
            path: path.into(),
            message: msg.to_string(),
        }
    }

    /// Create an IO error for `path`
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is worth retrying
    ///
    /// Configuration errors and a missing API group need an operator to act.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Generation { .. } => true,
            Error::Persistence { .. } => true,
            Error::UnsupportedApi { .. } => false,
            Error::WatchEstablish { .. } => true,
            Error::Io { .. } => true,
            Error::Timeout { .. } => true,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn persistence_error_names_resource() {
        let err = Error::persistence("secret operators/webhook", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("secret operators/webhook"));
        assert!(msg.contains("connection refused"));
        assert!(err.is_retryable());
    }

    #[test]
    fn unsupported_api_is_fatal() {
        let err = Error::unsupported_api("admissionregistration.k8s.io");
        assert!(err.to_string().contains("admissionregistration.k8s.io"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn watch_and_io_errors_include_path() {
        let err = Error::watch_establish("/certs/ca.crt", "no such file");
        assert!(err.to_string().contains("/certs/ca.crt"));

        let err = Error::io(
            "/certs/ca.crt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/certs/ca.crt"));
        assert!(err.is_retryable());
    }

    #[test]
    fn generation_error_wraps_pki_error() {
        let err: Error = PkiError::KeyGeneration("entropy exhausted".to_string()).into();
        assert!(matches!(err, Error::Generation { .. }));
        assert!(err.to_string().contains("entropy exhausted"));
        assert!(err.is_retryable());
    }

    #[test]
    fn kube_client_errors_are_not_retried() {
        let err: Error = api_error(422).into();
        assert!(!err.is_retryable());

        let err: Error = api_error(409).into();
        assert!(err.is_retryable());

        let err: Error = api_error(503).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_reports_bound() {
        let err = Error::timeout("patch webhook ca bundle", Duration::from_secs(5));
        assert_eq!(err.to_string(), "patch webhook ca bundle timed out after 5s");
    }

    #[test]
    fn config_errors_are_not_retried() {
        assert!(!Error::config("name must not be empty").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
    }
}
