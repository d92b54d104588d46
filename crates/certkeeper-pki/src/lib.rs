//! PKI for certkeeper
//!
//! Generates the self-signed CA and the serving certificate that an admission
//! webhook presents, and parses stored material back for validation.
//!
//! Everything in this crate is pure: no Kubernetes access and no file I/O.
//! Persistence and rotation decisions live in `certkeeper-operator`.
//!
//! # Public API
//!
//! - [`generate_certs`]: fresh CA + server certificate chain for a [`ServiceIdentity`]
//! - [`parse_key_pair`]: load a stored certificate/key pair, rejecting mismatches
//! - [`verify_issued_by`]: check a certificate was signed by a CA
//! - [`CertificateInfo`]: validity and subject details of a PEM certificate

#![deny(missing_docs)]

pub mod pki;

pub use pki::{
    generate_certs, parse_key_pair, parse_pem, verify_issued_by, CertificateInfo, GeneratedCerts,
    PkiError, Result, ServiceIdentity, CERT_VALIDITY_DAYS, RSA_KEY_BITS,
};
