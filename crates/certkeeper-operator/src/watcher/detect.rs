//! Admission registration API version detection

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroupList;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use certkeeper_common::Error;

use super::hooks::{V1Beta1WebhookApi, V1WebhookApi, WebhookConfigApi};

/// API group serving webhook configurations
pub const ADMISSION_GROUP: &str = "admissionregistration.k8s.io";

/// Schema variant of webhook configurations served by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// `admissionregistration.k8s.io/v1`
    V1,
    /// `admissionregistration.k8s.io/v1beta1`
    V1Beta1,
}

impl SchemaVersion {
    /// Version string as it appears in an apiVersion
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "v1",
            SchemaVersion::V1Beta1 => "v1beta1",
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", ADMISSION_GROUP, self.as_str())
    }
}

/// Pick the webhook schema from a discovery listing
///
/// Fails when the admission registration group is not served at all. When it
/// is served without `v1`, the legacy schema is assumed.
pub fn detect_schema_version(groups: &APIGroupList) -> Result<SchemaVersion, Error> {
    let group = groups
        .groups
        .iter()
        .find(|g| g.name == ADMISSION_GROUP)
        .ok_or_else(|| Error::unsupported_api(ADMISSION_GROUP))?;

    if group
        .versions
        .iter()
        .any(|v| v.version == SchemaVersion::V1.as_str())
    {
        Ok(SchemaVersion::V1)
    } else {
        Ok(SchemaVersion::V1Beta1)
    }
}

/// API discovery plus the webhook backend for a detected schema
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    /// List the API groups served by the cluster
    async fn api_groups(&self) -> Result<APIGroupList, Error>;

    /// Webhook configuration access for `version`
    fn webhook_api(&self, version: SchemaVersion) -> Arc<dyn WebhookConfigApi>;
}

/// Discovery against a live API server
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    /// Create a discovery backend using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaDiscovery for KubeDiscovery {
    async fn api_groups(&self) -> Result<APIGroupList, Error> {
        Ok(self.client.list_api_groups().await?)
    }

    fn webhook_api(&self, version: SchemaVersion) -> Arc<dyn WebhookConfigApi> {
        match version {
            SchemaVersion::V1 => Arc::new(V1WebhookApi::new(self.client.clone())),
            SchemaVersion::V1Beta1 => Arc::new(V1Beta1WebhookApi::new(self.client.clone())),
        }
    }
}
