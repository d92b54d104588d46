//! certkeeper operator
//!
//! Two independent loops keep an admission webhook's TLS setup healthy:
//!
//! - [`controller`] reconciles the serving certificate Secret, regenerating the
//!   CA and server certificate when data is missing, unreadable or close to
//!   expiry.
//! - [`watcher`] watches the mounted CA certificate and pushes its bytes into
//!   the `caBundle` of every webhook in the configured Mutating and Validating
//!   webhook configurations.
//!
//! They share no state; the Secret (mounted into the pod) is the only hand-off.

#![deny(missing_docs)]

pub mod controller;
pub mod watcher;
