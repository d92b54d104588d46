//! CA certificate watcher
//!
//! Keeps the `caBundle` of every webhook in the configured webhook
//! configurations equal to the CA certificate mounted on disk.
//!
//! Startup detects the served admission registration schema, performs one
//! sync pass and then watches the CA file. Writes, creations and removals of
//! the file trigger further passes; a removal first re-establishes the watch
//! because inotify watches do not survive unlink and recreate.

pub mod detect;
mod event_loop;
pub mod hooks;
pub mod sync;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use certkeeper_common::{Error, WatcherConfig, NETWORK_TIMEOUT};

pub use detect::{detect_schema_version, KubeDiscovery, SchemaDiscovery, SchemaVersion};
pub use hooks::{patch_ca_bundles, V1Beta1WebhookApi, V1WebhookApi, WebhookConfigApi};
pub use sync::CaSync;

use event_loop::EventLoop;

/// Capacity of the file-watch event queue
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Capacity of the file-watch error queue
const ERROR_QUEUE_CAPACITY: usize = 16;

/// How long shutdown waits for an in-flight sync pass
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Re-establishes the watch on a path after the file was replaced
#[cfg_attr(test, automock)]
pub trait PathWatch: Send + Sync {
    /// Watch the path again
    fn rewatch(&self) -> Result<(), Error>;
}

/// `notify` watch on a single file, feeding bounded queues
pub struct NotifyPathWatch {
    path: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl NotifyPathWatch {
    /// Start watching `path`, delivering events and errors to the given queues
    ///
    /// Both queues close once the watch is closed.
    pub fn establish(
        path: PathBuf,
        events: mpsc::Sender<notify::Event>,
        errors: mpsc::Sender<notify::Error>,
    ) -> Result<Self, Error> {
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| {
                // Runs on the notify backend thread, never inside the runtime
                let delivered = match result {
                    Ok(event) => events.blocking_send(event).is_ok(),
                    Err(err) => errors.blocking_send(err).is_ok(),
                };
                if !delivered {
                    debug!("webhook ca certificate watch queue closed");
                }
            },
        )
        .map_err(|e| Error::watch_establish(&path, e))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::watch_establish(&path, e))?;

        Ok(Self {
            path,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Path being watched
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the underlying watch, closing both queues
    pub fn close(&self) {
        let watcher = match self.watcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(watcher);
    }
}

impl PathWatch for NotifyPathWatch {
    fn rewatch(&self) -> Result<(), Error> {
        let mut guard = self
            .watcher
            .lock()
            .map_err(|_| Error::watch_establish(&self.path, "watch handle poisoned"))?;
        let watcher = guard
            .as_mut()
            .ok_or_else(|| Error::watch_establish(&self.path, "watch is closed"))?;

        // The kernel drops the watch with the inode; forget our record of it
        if let Err(e) = watcher.unwatch(&self.path) {
            debug!(path = %self.path.display(), error = %e, "stale watch already gone");
        }
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::watch_establish(&self.path, e))
    }
}

/// Watches the CA certificate and propagates it to webhook configurations
pub struct CaWatcher {
    config: WatcherConfig,
    discovery: Arc<dyn SchemaDiscovery>,
}

impl CaWatcher {
    /// Create a watcher; nothing happens until [`CaWatcher::run`]
    pub fn new(config: WatcherConfig, discovery: Arc<dyn SchemaDiscovery>) -> Self {
        Self { config, discovery }
    }

    /// Detect the served webhook schema, bounded by the network timeout
    pub async fn detect_schema(&self) -> Result<SchemaVersion, Error> {
        let groups = tokio::time::timeout(NETWORK_TIMEOUT, self.discovery.api_groups())
            .await
            .map_err(|_| Error::timeout("api discovery", NETWORK_TIMEOUT))??;
        detect_schema_version(&groups)
    }

    /// Resolve the webhook backend and perform the initial sync pass
    pub async fn prepare(&self) -> Result<CaSync, Error> {
        let schema = self.detect_schema().await?;
        info!(schema = %schema, "detected webhook configuration api");

        let sync = CaSync::new(self.config.clone(), self.discovery.webhook_api(schema));
        sync.sync().await?;
        Ok(sync)
    }

    /// Run until `token` is cancelled
    ///
    /// Fails before watching if the schema cannot be detected, the initial
    /// sync fails or the watch cannot be established.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        let sync = self.prepare().await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);
        let watch = Arc::new(NotifyPathWatch::establish(
            self.config.ca_path.clone(),
            events_tx,
            errors_tx,
        )?);

        info!(path = %watch.path().display(), "starting webhook ca certificate watcher");
        let event_loop =
            EventLoop::new(events_rx, errors_rx, watch.clone(), sync, token.clone());
        let handle = tokio::spawn(event_loop.run());

        token.cancelled().await;
        info!("stopping webhook ca certificate watcher");
        watch.close();

        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "webhook ca certificate watch loop failed"),
            Err(_) => warn!("webhook ca certificate watch loop did not stop in time"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        APIGroup, APIGroupList, GroupVersionForDiscovery,
    };
    use mockall::predicate::eq;
    use serde_json::Value;

    use crate::watcher::detect::{MockSchemaDiscovery, ADMISSION_GROUP};
    use crate::watcher::hooks::{WebhookEntry, WebhookKind};

    fn groups(versions: &[&str]) -> APIGroupList {
        APIGroupList {
            groups: vec![APIGroup {
                name: ADMISSION_GROUP.to_string(),
                versions: versions
                    .iter()
                    .map(|v| GroupVersionForDiscovery {
                        group_version: format!("{ADMISSION_GROUP}/{v}"),
                        version: v.to_string(),
                    })
                    .collect(),
                preferred_version: None,
                server_address_by_client_cidrs: None,
            }],
        }
    }

    /// Backend that records the bundles it was asked to set
    struct RecordingApi {
        schema: SchemaVersion,
        bundle: Mutex<Vec<u8>>,
        patches: AtomicUsize,
    }

    impl RecordingApi {
        fn new(schema: SchemaVersion) -> Arc<Self> {
            Arc::new(Self {
                schema,
                bundle: Mutex::new(Vec::new()),
                patches: AtomicUsize::new(0),
            })
        }

        fn bundle(&self) -> Vec<u8> {
            self.bundle.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookConfigApi for RecordingApi {
        fn schema(&self) -> SchemaVersion {
            self.schema
        }

        async fn fetch_entries(
            &self,
            _kind: WebhookKind,
            _name: &str,
        ) -> Result<Vec<WebhookEntry>, Error> {
            Ok(vec![WebhookEntry {
                name: "hook".to_string(),
                ca_bundle: self.bundle(),
            }])
        }

        async fn patch_entries(
            &self,
            _kind: WebhookKind,
            _name: &str,
            patch: Value,
        ) -> Result<(), Error> {
            let bundle: k8s_openapi::ByteString =
                serde_json::from_value(patch["webhooks"][0]["clientConfig"]["caBundle"].clone())
                    .map_err(|e| Error::serialization(e.to_string()))?;
            // Both configurations read the same entry, so only the first is stale
            self.patches.fetch_add(1, Ordering::SeqCst);
            *self.bundle.lock().unwrap() = bundle.0;
            Ok(())
        }
    }

    fn discovery(
        versions: &'static [&'static str],
        api: Arc<RecordingApi>,
        expected: SchemaVersion,
    ) -> MockSchemaDiscovery {
        let mut discovery = MockSchemaDiscovery::new();
        discovery
            .expect_api_groups()
            .times(1)
            .returning(move || Ok(groups(versions)));
        discovery
            .expect_webhook_api()
            .with(eq(expected))
            .times(1)
            .returning(move |_| api.clone() as Arc<dyn WebhookConfigApi>);
        discovery
    }

    fn watcher_config(dir: &tempfile::TempDir) -> WatcherConfig {
        WatcherConfig {
            ca_path: dir.path().join("ca.crt"),
            mutating_webhook: "hooks".to_string(),
            validating_webhook: "hooks".to_string(),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not met within 5s");
    }

    #[tokio::test]
    async fn unsupported_api_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut discovery = MockSchemaDiscovery::new();
        discovery
            .expect_api_groups()
            .returning(|| Ok(APIGroupList { groups: Vec::new() }));
        discovery.expect_webhook_api().never();

        let watcher = CaWatcher::new(watcher_config(&dir), Arc::new(discovery));
        let err = watcher.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedApi { .. }));
    }

    #[tokio::test]
    async fn missing_ca_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let api = RecordingApi::new(SchemaVersion::V1);
        let discovery = discovery(&["v1"], api.clone(), SchemaVersion::V1);

        let watcher = CaWatcher::new(watcher_config(&dir), Arc::new(discovery));
        let err = watcher.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(api.patches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prepare_syncs_once_with_detected_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), b"first").unwrap();
        let api = RecordingApi::new(SchemaVersion::V1);
        let discovery = discovery(&["v1", "v1beta1"], api.clone(), SchemaVersion::V1);

        let watcher = CaWatcher::new(watcher_config(&dir), Arc::new(discovery));
        let sync = watcher.prepare().await.unwrap();

        assert_eq!(sync.hooks().schema(), SchemaVersion::V1);
        assert_eq!(api.bundle(), b"first");
        assert_eq!(api.patches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn legacy_schema_is_used_for_later_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, b"first").unwrap();

        let api = RecordingApi::new(SchemaVersion::V1Beta1);
        let discovery = discovery(&["v1beta1"], api.clone(), SchemaVersion::V1Beta1);
        let watcher = Arc::new(CaWatcher::new(watcher_config(&dir), Arc::new(discovery)));

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let watcher = watcher.clone();
            let token = token.clone();
            async move { watcher.run(token).await }
        });

        wait_for(|| api.bundle() == b"first").await;
        // Give the watch a moment to be registered after the initial pass
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&ca_path, b"second").unwrap();
        wait_for(|| api.bundle() == b"second").await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("watcher should stop after cancellation")
            .unwrap()
            .unwrap();
        assert!(api.patches.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn late_recreate_after_remove_resumes_sync() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, b"first").unwrap();

        let api = RecordingApi::new(SchemaVersion::V1);
        let discovery = discovery(&["v1"], api.clone(), SchemaVersion::V1);
        let watcher = Arc::new(CaWatcher::new(watcher_config(&dir), Arc::new(discovery)));

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let watcher = watcher.clone();
            let token = token.clone();
            async move { watcher.run(token).await }
        });

        wait_for(|| api.bundle() == b"first").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Recreate only after the loop has seen the removal and failed to re-watch
        std::fs::remove_file(&ca_path).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        std::fs::write(&ca_path, b"second").unwrap();
        wait_for(|| api.bundle() == b"second").await;

        // The restored watch keeps delivering later writes
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&ca_path, b"third").unwrap();
        wait_for(|| api.bundle() == b"third").await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("watcher should stop after cancellation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn rewatch_after_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"ca").unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, _errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);
        let watch = NotifyPathWatch::establish(path.clone(), events_tx, errors_tx).unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"ca2").unwrap();
        watch.rewatch().unwrap();

        watch.close();
        // Queue closes once the backend thread drops its sender
        tokio::time::timeout(Duration::from_secs(5), async {
            while events_rx.recv().await.is_some() {}
        })
        .await
        .expect("event queue should close after the watch is closed");
    }

    #[tokio::test]
    async fn rewatch_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"ca").unwrap();

        let (events_tx, _events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, _errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);
        let watch = NotifyPathWatch::establish(path, events_tx, errors_tx).unwrap();
        watch.close();

        assert!(matches!(
            watch.rewatch(),
            Err(Error::WatchEstablish { .. })
        ));
    }

    #[test]
    fn establish_on_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, _errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        let result =
            NotifyPathWatch::establish(dir.path().join("missing.crt"), events_tx, errors_tx);
        assert!(matches!(result, Err(Error::WatchEstablish { .. })));
    }
}
