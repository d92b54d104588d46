//! Serving certificate Secret reconciliation
//!
//! Fetches the configured Secret, decides whether its certificates are still
//! usable and, if not, generates a new CA and server certificate and writes
//! all three data keys back in a single merge patch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use certkeeper_common::{CertOptions, Error, FIELD_MANAGER};
use certkeeper_pki::{generate_certs, parse_key_pair, ServiceIdentity, CERT_VALIDITY_DAYS};

/// How often a valid Secret is re-checked when nothing changes it
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60 * 60);

/// Requeue delay after a failed reconciliation
const REQUEUE_ERROR_SECS: u64 = 5;

/// Trait abstracting the Secret reads and writes the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Get a Secret by name, `None` if it does not exist
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Replace the given data keys with a JSON merge patch
    async fn patch_secret_data(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct SecretClientImpl {
    client: Client,
}

impl SecretClientImpl {
    /// Create a new SecretClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretClient for SecretClientImpl {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_secret_data(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let patch = merge_patch(data);

        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::persistence(format!("secret {namespace}/{name}"), e))?;

        Ok(())
    }
}

fn merge_patch(data: BTreeMap<String, ByteString>) -> serde_json::Value {
    serde_json::json!({ "data": data })
}

/// Controller context shared by every reconciliation
pub struct Context {
    /// Secret access
    pub client: Arc<dyn SecretClient>,
    /// Defaulted and validated options
    pub options: CertOptions,
    /// Upper bound on the requeue delay for a valid Secret
    pub resync_interval: Duration,
}

impl Context {
    /// Create a context backed by the given Kubernetes client
    pub fn new(client: Client, options: CertOptions) -> Self {
        Self {
            client: Arc::new(SecretClientImpl::new(client)),
            options,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Override the periodic resync interval
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn SecretClient>, options: CertOptions) -> Self {
        Self {
            client,
            options,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// Why stored certificates have to be replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerationReason {
    /// A data key is absent
    MissingKey(String),
    /// Certificate or key does not parse, or they do not belong together
    InvalidKeyPair(String),
    /// Leaf certificate expires within the lead time
    Expiring {
        /// Expiry of the stored leaf (Unix timestamp)
        not_after: i64,
    },
}

impl fmt::Display for RegenerationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "missing key {key}"),
            Self::InvalidKeyPair(msg) => write!(f, "invalid key pair: {msg}"),
            Self::Expiring { not_after } => write!(f, "certificate expires at {not_after}"),
        }
    }
}

/// Outcome of checking a stored Secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Certificates are usable for at least `remaining` beyond the lead time
    Valid {
        /// Time left before the lead time window is entered
        remaining: Duration,
    },
    /// Certificates must be regenerated
    Regenerate(RegenerationReason),
}

/// Decide whether the Secret's certificates are still usable at `now`
///
/// Keys are checked in order server key, server certificate, CA certificate.
/// The leaf must stay valid strictly after `now + update_before`.
pub fn check_secret(secret: &Secret, options: &CertOptions, now: OffsetDateTime) -> Validity {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);

    let (cert, key) = match stored_pair(data, options) {
        Ok(pair) => pair,
        Err(reason) => return Validity::Regenerate(reason),
    };

    let info = match parse_key_pair(cert, key) {
        Ok(info) => info,
        Err(e) => {
            return Validity::Regenerate(RegenerationReason::InvalidKeyPair(e.to_string()));
        }
    };

    let expiring = Validity::Regenerate(RegenerationReason::Expiring {
        not_after: info.not_after,
    });
    // A lead time past the last representable date covers every certificate
    let Some(threshold) = time::Duration::try_from(options.update_before)
        .ok()
        .and_then(|lead| now.checked_add(lead))
    else {
        return expiring;
    };
    if info.expires_by(threshold) {
        return expiring;
    }

    let remaining = info.not_after - threshold.unix_timestamp();
    Validity::Valid {
        remaining: Duration::from_secs(remaining.max(0) as u64),
    }
}

/// Server certificate and key, provided all three data keys are present
fn stored_pair<'a>(
    data: &'a BTreeMap<String, ByteString>,
    options: &CertOptions,
) -> Result<(&'a [u8], &'a [u8]), RegenerationReason> {
    let get = |key: &String| {
        data.get(key)
            .map(|value| value.0.as_slice())
            .ok_or_else(|| RegenerationReason::MissingKey(key.clone()))
    };
    let key = get(&options.server_key)?;
    let cert = get(&options.server_cert)?;
    get(&options.ca_cert)?;
    Ok((cert, key))
}

/// Reconcile the serving certificate Secret
///
/// The Secret is re-read by its configured name so the decision is always
/// made against the latest stored data.
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any()))]
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let options = &ctx.options;

    let Some(current) = ctx
        .client
        .get_secret(&options.name, &options.namespace)
        .await?
    else {
        // Deleted Secrets are not recreated; something else owns creation
        error!(
            namespace = %options.namespace,
            name = %options.name,
            "could not find cert secret"
        );
        return Ok(Action::await_change());
    };

    let now = OffsetDateTime::now_utc();
    match check_secret(&current, options, now) {
        Validity::Valid { remaining } => {
            debug!(
                remaining_secs = remaining.as_secs(),
                "certificates are valid"
            );
            Ok(Action::requeue(remaining.min(ctx.resync_interval)))
        }
        Validity::Regenerate(reason) => {
            info!(
                object = %ObjectRef::from_obj(&current),
                %reason,
                "recreating certificates"
            );
            regenerate(&ctx, now).await?;
            Ok(Action::requeue(ctx.resync_interval))
        }
    }
}

/// Generate fresh certificates valid for one year and persist them
async fn regenerate(ctx: &Context, now: OffsetDateTime) -> Result<(), Error> {
    let options = &ctx.options;
    let identity = ServiceIdentity::new(&options.name, &options.namespace);
    let not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let certs = generate_certs(&identity, &options.organization, not_after)?;

    let data = BTreeMap::from([
        (
            options.server_key.clone(),
            ByteString(certs.server_key_pem.as_bytes().to_vec()),
        ),
        (
            options.server_cert.clone(),
            ByteString(certs.server_cert_pem.into_bytes()),
        ),
        (
            options.ca_cert.clone(),
            ByteString(certs.ca_cert_pem.into_bytes()),
        ),
    ]);

    ctx.client
        .patch_secret_data(&options.name, &options.namespace, data)
        .await?;

    info!(not_after = %not_after, "certificates recreated");
    Ok(())
}

/// Error policy for the Secret controller
pub fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        secret = %secret.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}
