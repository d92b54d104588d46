//! Shared types for certkeeper: errors, resolved options and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod options;
pub mod telemetry;

pub use error::Error;
pub use options::{
    CertOptions, WatcherConfig, DEFAULT_CA_CERT, DEFAULT_CERT_DIR, DEFAULT_ORGANIZATION,
    DEFAULT_SERVER_CERT, DEFAULT_SERVER_KEY, DEFAULT_UPDATE_BEFORE, MAX_UPDATE_BEFORE,
};

/// Result type alias using our Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field manager for server-side apply and patch operations
pub const FIELD_MANAGER: &str = "certkeeper";

/// Upper bound on any single network round trip (sync pass, discovery)
pub const NETWORK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
