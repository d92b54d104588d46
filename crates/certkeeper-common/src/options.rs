//! Resolved configuration for the reconciler and the CA watcher

use std::path::PathBuf;
use std::time::Duration;

use certkeeper_pki::CERT_VALIDITY_DAYS;

use crate::error::Error;

/// Directory the CA and serving certificate are mounted into
pub const DEFAULT_CERT_DIR: &str = "certs";
/// Secret key holding the PKCS#1 server key
pub const DEFAULT_SERVER_KEY: &str = "tls.key";
/// Secret key holding the server certificate
pub const DEFAULT_SERVER_CERT: &str = "tls.crt";
/// Secret key holding the CA certificate
pub const DEFAULT_CA_CERT: &str = "ca.crt";
/// Subject organization of generated certificates
pub const DEFAULT_ORGANIZATION: &str = "cluster.local";
/// Regenerate once the certificate expires within this window
pub const DEFAULT_UPDATE_BEFORE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Lead times at or beyond a certificate's lifetime would rotate on every check
pub const MAX_UPDATE_BEFORE: Duration =
    Duration::from_secs(CERT_VALIDITY_DAYS as u64 * 24 * 60 * 60);

/// Options controlling where certificates live and when they rotate
///
/// Empty fields are filled by [`CertOptions::apply_defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertOptions {
    /// Name of the Secret, also the service name used in the certificate
    pub name: String,
    /// Namespace of the Secret and the service
    pub namespace: String,
    /// Directory the Secret is mounted at
    pub cert_dir: PathBuf,
    /// Secret key for the server private key
    pub server_key: String,
    /// Secret key for the server certificate
    pub server_cert: String,
    /// Secret key for the CA certificate
    pub ca_cert: String,
    /// Lead time before expiry at which certificates are regenerated
    pub update_before: Duration,
    /// Name of the MutatingWebhookConfiguration to keep in sync
    pub mutating_webhook: String,
    /// Name of the ValidatingWebhookConfiguration to keep in sync
    pub validating_webhook: String,
    /// Subject organization of generated certificates
    pub organization: String,
}

impl CertOptions {
    /// Options for the Secret `namespace/name`, all other fields defaulted
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut options = Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        };
        let name = options.name.clone();
        options.apply_defaults(&name);
        options
    }

    /// Fill every empty field with its default
    ///
    /// Webhook configuration names default to `name`. Fields that are already
    /// set are left untouched.
    pub fn apply_defaults(&mut self, name: &str) {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        if self.cert_dir.as_os_str().is_empty() {
            self.cert_dir = PathBuf::from(DEFAULT_CERT_DIR);
        }
        if self.server_key.is_empty() {
            self.server_key = DEFAULT_SERVER_KEY.to_string();
        }
        if self.server_cert.is_empty() {
            self.server_cert = DEFAULT_SERVER_CERT.to_string();
        }
        if self.ca_cert.is_empty() {
            self.ca_cert = DEFAULT_CA_CERT.to_string();
        }
        if self.update_before.is_zero() {
            self.update_before = DEFAULT_UPDATE_BEFORE;
        }
        if self.mutating_webhook.is_empty() {
            self.mutating_webhook = name.to_string();
        }
        if self.validating_webhook.is_empty() {
            self.validating_webhook = name.to_string();
        }
        if self.organization.is_empty() {
            self.organization = DEFAULT_ORGANIZATION.to_string();
        }
    }

    /// Reject options that cannot describe a usable Secret
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::config("secret name must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        let keys = [&self.server_key, &self.server_cert, &self.ca_cert];
        if keys.iter().any(|k| k.is_empty()) {
            return Err(Error::config("secret data keys must not be empty"));
        }
        if keys[0] == keys[1] || keys[0] == keys[2] || keys[1] == keys[2] {
            return Err(Error::config(format!(
                "secret data keys must be distinct, got {}, {}, {}",
                keys[0], keys[1], keys[2]
            )));
        }
        if self.update_before.is_zero() {
            return Err(Error::config("update-before must be greater than zero"));
        }
        if self.update_before >= MAX_UPDATE_BEFORE {
            return Err(Error::config(format!(
                "update-before must be shorter than the {CERT_VALIDITY_DAYS} day certificate lifetime"
            )));
        }
        Ok(())
    }

    /// Path of the mounted CA certificate
    pub fn ca_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_cert)
    }
}

/// What the CA watcher needs, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// CA certificate file to watch
    pub ca_path: PathBuf,
    /// MutatingWebhookConfiguration whose bundles are kept current
    pub mutating_webhook: String,
    /// ValidatingWebhookConfiguration whose bundles are kept current
    pub validating_webhook: String,
}

impl WatcherConfig {
    /// Derive the watcher configuration from defaulted options
    pub fn from_options(options: &CertOptions) -> Self {
        Self {
            ca_path: options.ca_path(),
            mutating_webhook: options.mutating_webhook.clone(),
            validating_webhook: options.validating_webhook.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_empty_field() {
        let mut options = CertOptions::default();
        options.apply_defaults("webhook");

        assert_eq!(options.name, "webhook");
        assert_eq!(options.cert_dir, PathBuf::from("certs"));
        assert_eq!(options.server_key, "tls.key");
        assert_eq!(options.server_cert, "tls.crt");
        assert_eq!(options.ca_cert, "ca.crt");
        assert_eq!(options.update_before, Duration::from_secs(604_800));
        assert_eq!(options.mutating_webhook, "webhook");
        assert_eq!(options.validating_webhook, "webhook");
        assert_eq!(options.organization, "cluster.local");
    }

    #[test]
    fn defaults_preserve_overrides() {
        let mut options = CertOptions {
            cert_dir: PathBuf::from("/etc/webhook"),
            ca_cert: "root.pem".to_string(),
            update_before: Duration::from_secs(3600),
            mutating_webhook: "mutate".to_string(),
            organization: "example.org".to_string(),
            ..Default::default()
        };
        options.apply_defaults("webhook");

        assert_eq!(options.cert_dir, PathBuf::from("/etc/webhook"));
        assert_eq!(options.ca_cert, "root.pem");
        assert_eq!(options.update_before, Duration::from_secs(3600));
        assert_eq!(options.mutating_webhook, "mutate");
        assert_eq!(options.validating_webhook, "webhook");
        assert_eq!(options.organization, "example.org");
    }

    #[test]
    fn new_is_valid() {
        let options = CertOptions::new("webhook", "operators");
        assert!(options.validate().is_ok());
        assert_eq!(options.ca_path(), PathBuf::from("certs/ca.crt"));
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let mut options = CertOptions::new("webhook", "operators");
        options.namespace.clear();
        assert!(matches!(options.validate(), Err(Error::Config { .. })));

        let mut options = CertOptions::new("webhook", "operators");
        options.name.clear();
        assert!(options.validate().is_err());
    }

    #[test]
    fn validate_rejects_colliding_keys() {
        let mut options = CertOptions::new("webhook", "operators");
        options.ca_cert = "tls.crt".to_string();
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn validate_rejects_zero_lead_time() {
        let mut options = CertOptions::new("webhook", "operators");
        options.update_before = Duration::ZERO;
        assert!(options.validate().is_err());
    }

    #[test]
    fn validate_rejects_lead_time_beyond_lifetime() {
        let mut options = CertOptions::new("webhook", "operators");
        options.update_before = Duration::from_secs(u64::MAX / 4);
        assert!(matches!(options.validate(), Err(Error::Config { .. })));

        options.update_before = MAX_UPDATE_BEFORE;
        assert!(options.validate().is_err());

        options.update_before = MAX_UPDATE_BEFORE - Duration::from_secs(1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn watcher_config_follows_options() {
        let mut options = CertOptions {
            cert_dir: PathBuf::from("/tmp/k8s-webhook-server/serving-certs"),
            validating_webhook: "validate".to_string(),
            ..Default::default()
        };
        options.apply_defaults("webhook");

        let config = WatcherConfig::from_options(&options);
        assert_eq!(
            config.ca_path,
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/ca.crt")
        );
        assert_eq!(config.mutating_webhook, "webhook");
        assert_eq!(config.validating_webhook, "validate");
    }
}
