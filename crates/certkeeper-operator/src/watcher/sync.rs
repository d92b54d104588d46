//! One synchronization pass: read the CA file, patch every webhook

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use certkeeper_common::{Error, WatcherConfig, NETWORK_TIMEOUT};

use super::hooks::{patch_ca_bundles, WebhookConfigApi};

/// Pushes the CA file's bytes into the webhook configurations
#[derive(Clone)]
pub struct CaSync {
    config: WatcherConfig,
    hooks: Arc<dyn WebhookConfigApi>,
    timeout: Duration,
}

impl CaSync {
    /// Create a sync pass for `config` using the resolved `hooks` backend
    pub fn new(config: WatcherConfig, hooks: Arc<dyn WebhookConfigApi>) -> Self {
        Self {
            config,
            hooks,
            timeout: NETWORK_TIMEOUT,
        }
    }

    /// Override the bound on the patch step
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The backend every pass goes through
    pub fn hooks(&self) -> &Arc<dyn WebhookConfigApi> {
        &self.hooks
    }

    /// Read the CA file and patch stale bundles
    ///
    /// The read is not bounded; the patch step is bounded by the timeout.
    pub async fn sync(&self) -> Result<(), Error> {
        let path = &self.config.ca_path;
        let ca_bundle = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(path, e))?;

        debug!(path = %path.display(), bytes = ca_bundle.len(), "read webhook ca cert");

        tokio::time::timeout(
            self.timeout,
            patch_ca_bundles(self.hooks.as_ref(), &self.config, &ca_bundle),
        )
        .await
        .map_err(|_| Error::timeout("patch webhook ca cert", self.timeout))?
    }
}
