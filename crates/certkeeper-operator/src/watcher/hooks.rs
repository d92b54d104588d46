//! Webhook configuration CA bundle patching
//!
//! One [`WebhookConfigApi`] backend exists per served schema. Both are driven by
//! [`patch_ca_bundles`], which only ever sends the webhooks whose bundle is
//! out of date.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use certkeeper_common::{Error, WatcherConfig, FIELD_MANAGER};

use super::detect::{SchemaVersion, ADMISSION_GROUP};

/// Which of the two webhook configuration kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    /// MutatingWebhookConfiguration
    Mutating,
    /// ValidatingWebhookConfiguration
    Validating,
}

impl WebhookKind {
    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookKind::Mutating => "MutatingWebhookConfiguration",
            WebhookKind::Validating => "ValidatingWebhookConfiguration",
        }
    }
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A named webhook and the CA bundle it currently trusts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEntry {
    /// Webhook name, unique within its configuration
    pub name: String,
    /// Current `clientConfig.caBundle`, empty when unset
    pub ca_bundle: Vec<u8>,
}

/// Read and patch webhook configurations of one schema version
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookConfigApi: Send + Sync {
    /// Schema this backend speaks
    fn schema(&self) -> SchemaVersion;

    /// Fetch the webhooks of configuration `name`
    async fn fetch_entries(&self, kind: WebhookKind, name: &str)
        -> Result<Vec<WebhookEntry>, Error>;

    /// Apply a strategic merge patch to configuration `name`
    async fn patch_entries(&self, kind: WebhookKind, name: &str, patch: Value)
        -> Result<(), Error>;
}

/// Bring every webhook in both configurations to `ca_bundle`
///
/// The mutating configuration is handled before the validating one. A fetch
/// or patch failure stops the pass and is returned.
pub async fn patch_ca_bundles(
    api: &dyn WebhookConfigApi,
    config: &WatcherConfig,
    ca_bundle: &[u8],
) -> Result<(), Error> {
    let targets = [
        (WebhookKind::Mutating, config.mutating_webhook.as_str()),
        (WebhookKind::Validating, config.validating_webhook.as_str()),
    ];

    for (kind, name) in targets {
        let mut entries = api.fetch_entries(kind, name).await?;
        let stale = refresh_entries(&mut entries, ca_bundle);

        if stale.is_empty() {
            debug!(kind = %kind, name = %name, "webhook ca bundles are current");
            continue;
        }

        info!(
            kind = %kind,
            name = %name,
            schema = %api.schema(),
            webhooks = ?stale,
            "updating webhook ca cert"
        );
        api.patch_entries(kind, name, bundle_patch(&stale, ca_bundle))
            .await?;
    }

    Ok(())
}

/// Set every entry to `ca_bundle`, returning the names that differed
fn refresh_entries(entries: &mut [WebhookEntry], ca_bundle: &[u8]) -> Vec<String> {
    let mut stale = Vec::new();
    for entry in entries.iter_mut() {
        if entry.ca_bundle != ca_bundle {
            stale.push(entry.name.clone());
        }
        entry.ca_bundle = ca_bundle.to_vec();
    }
    stale
}

/// Strategic merge patch setting `caBundle` on the named webhooks only
pub fn bundle_patch(names: &[String], ca_bundle: &[u8]) -> Value {
    let bundle = ByteString(ca_bundle.to_vec());
    let webhooks: Vec<Value> = names
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "clientConfig": { "caBundle": bundle },
            })
        })
        .collect();

    serde_json::json!({ "webhooks": webhooks })
}

fn patch_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER)
}

fn persistence_error(kind: WebhookKind, name: &str, err: kube::Error) -> Error {
    Error::persistence(format!("{kind} {name}"), err)
}

/// `admissionregistration.k8s.io/v1` backend using typed objects
pub struct V1WebhookApi {
    client: Client,
}

impl V1WebhookApi {
    /// Create a v1 backend using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookConfigApi for V1WebhookApi {
    fn schema(&self) -> SchemaVersion {
        SchemaVersion::V1
    }

    async fn fetch_entries(
        &self,
        kind: WebhookKind,
        name: &str,
    ) -> Result<Vec<WebhookEntry>, Error> {
        let entries = match kind {
            WebhookKind::Mutating => {
                let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
                api.get(name)
                    .await?
                    .webhooks
                    .unwrap_or_default()
                    .into_iter()
                    .map(|w| WebhookEntry {
                        name: w.name,
                        ca_bundle: w.client_config.ca_bundle.map(|b| b.0).unwrap_or_default(),
                    })
                    .collect()
            }
            WebhookKind::Validating => {
                let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
                api.get(name)
                    .await?
                    .webhooks
                    .unwrap_or_default()
                    .into_iter()
                    .map(|w| WebhookEntry {
                        name: w.name,
                        ca_bundle: w.client_config.ca_bundle.map(|b| b.0).unwrap_or_default(),
                    })
                    .collect()
            }
        };
        Ok(entries)
    }

    async fn patch_entries(
        &self,
        kind: WebhookKind,
        name: &str,
        patch: Value,
    ) -> Result<(), Error> {
        let result = match kind {
            WebhookKind::Mutating => {
                let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
                api.patch(name, &patch_params(), &Patch::Strategic(&patch))
                    .await
                    .map(|_| ())
            }
            WebhookKind::Validating => {
                let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
                api.patch(name, &patch_params(), &Patch::Strategic(&patch))
                    .await
                    .map(|_| ())
            }
        };
        result.map_err(|e| persistence_error(kind, name, e))
    }
}

/// `admissionregistration.k8s.io/v1beta1` backend
///
/// k8s-openapi no longer ships v1beta1 admission types, so objects are read
/// untyped through [`DynamicObject`].
pub struct V1Beta1WebhookApi {
    client: Client,
}

impl V1Beta1WebhookApi {
    /// Create a v1beta1 backend using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: WebhookKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(
            ADMISSION_GROUP,
            SchemaVersion::V1Beta1.as_str(),
            kind.kind(),
        );
        Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk))
    }
}

#[async_trait]
impl WebhookConfigApi for V1Beta1WebhookApi {
    fn schema(&self) -> SchemaVersion {
        SchemaVersion::V1Beta1
    }

    async fn fetch_entries(
        &self,
        kind: WebhookKind,
        name: &str,
    ) -> Result<Vec<WebhookEntry>, Error> {
        let obj = self.api(kind).get(name).await?;
        dynamic_entries(&obj)
    }

    async fn patch_entries(
        &self,
        kind: WebhookKind,
        name: &str,
        patch: Value,
    ) -> Result<(), Error> {
        self.api(kind)
            .patch(name, &patch_params(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| persistence_error(kind, name, e))?;
        Ok(())
    }
}

/// Webhook entries of an untyped webhook configuration
fn dynamic_entries(obj: &DynamicObject) -> Result<Vec<WebhookEntry>, Error> {
    let Some(webhooks) = obj.data.get("webhooks") else {
        return Ok(Vec::new());
    };
    if webhooks.is_null() {
        return Ok(Vec::new());
    }
    let webhooks = webhooks
        .as_array()
        .ok_or_else(|| Error::serialization("webhooks is not a list"))?;

    webhooks
        .iter()
        .map(|webhook| {
            let name = webhook
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::serialization("webhook entry without a name"))?;

            let ca_bundle = match webhook.pointer("/clientConfig/caBundle") {
                None | Some(Value::Null) => Vec::new(),
                Some(value) => {
                    serde_json::from_value::<ByteString>(value.clone())
                        .map_err(|e| {
                            Error::serialization(format!("invalid caBundle on webhook {name}: {e}"))
                        })?
                        .0
                }
            };

            Ok(WebhookEntry {
                name: name.to_string(),
                ca_bundle,
            })
        })
        .collect()
}
