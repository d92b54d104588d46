//! certkeeper - self-signed webhook certificates for Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use certkeeper_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use certkeeper_common::{
    CertOptions, WatcherConfig, DEFAULT_CA_CERT, DEFAULT_CERT_DIR, DEFAULT_ORGANIZATION,
    DEFAULT_SERVER_CERT, DEFAULT_SERVER_KEY,
};
use certkeeper_operator::controller::{error_policy, reconcile, Context, DEFAULT_RESYNC_INTERVAL};
use certkeeper_operator::watcher::{CaWatcher, KubeDiscovery};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// certkeeper - keeps an admission webhook's TLS certificate and CA bundles current
#[derive(Parser, Debug)]
#[command(name = "certkeeper", version, about, long_about = None)]
struct Cli {
    /// Secret holding the serving certificate; also the Service name
    #[arg(long, env = "CERTKEEPER_SECRET_NAME")]
    secret_name: String,

    /// Namespace of the Secret and the Service
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Directory the Secret is mounted at
    #[arg(long, env = "CERTKEEPER_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    cert_dir: PathBuf,

    /// Secret key of the server private key
    #[arg(long, default_value = DEFAULT_SERVER_KEY)]
    server_key: String,

    /// Secret key of the server certificate
    #[arg(long, default_value = DEFAULT_SERVER_CERT)]
    server_cert: String,

    /// Secret key of the CA certificate
    #[arg(long, default_value = DEFAULT_CA_CERT)]
    ca_cert: String,

    /// Regenerate certificates this many hours before they expire
    #[arg(long, env = "CERTKEEPER_UPDATE_BEFORE_HOURS", default_value_t = 168)]
    update_before_hours: u64,

    /// MutatingWebhookConfiguration to keep in sync (defaults to the secret name)
    #[arg(long)]
    mutating_webhook: Option<String>,

    /// ValidatingWebhookConfiguration to keep in sync (defaults to the secret name)
    #[arg(long)]
    validating_webhook: Option<String>,

    /// Subject organization of generated certificates
    #[arg(long, default_value = DEFAULT_ORGANIZATION)]
    organization: String,

    /// Upper bound in seconds between checks of a valid Secret
    #[arg(long, default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs())]
    resync_secs: u64,

    /// Log output format: json or text
    #[arg(long, env = "CERTKEEPER_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn cert_options(&self) -> anyhow::Result<CertOptions> {
        let mut options = CertOptions {
            name: self.secret_name.clone(),
            namespace: self.namespace.clone(),
            cert_dir: self.cert_dir.clone(),
            server_key: self.server_key.clone(),
            server_cert: self.server_cert.clone(),
            ca_cert: self.ca_cert.clone(),
            update_before: self.update_before()?,
            mutating_webhook: self.mutating_webhook.clone().unwrap_or_default(),
            validating_webhook: self.validating_webhook.clone().unwrap_or_default(),
            organization: self.organization.clone(),
        };
        options.apply_defaults(&self.secret_name);
        options.validate()?;
        Ok(options)
    }

    fn update_before(&self) -> anyhow::Result<Duration> {
        let secs = self
            .update_before_hours
            .checked_mul(60 * 60)
            .ok_or_else(|| anyhow::anyhow!("--update-before-hours is out of range"))?;
        Ok(Duration::from_secs(secs))
    }

    fn resync_interval(&self) -> anyhow::Result<Duration> {
        if self.resync_secs == 0 {
            anyhow::bail!("--resync-secs must be greater than zero");
        }
        Ok(Duration::from_secs(self.resync_secs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "certkeeper".to_string(),
        format: cli.log_format,
    })?;

    let options = cli.cert_options()?;
    let resync_interval = cli.resync_interval()?;
    let client = Client::try_default().await?;

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    run(client, options, resync_interval, token).await
}

async fn run(
    client: Client,
    options: CertOptions,
    resync_interval: Duration,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let watcher = CaWatcher::new(
        WatcherConfig::from_options(&options),
        Arc::new(KubeDiscovery::new(client.clone())),
    );
    let watcher_token = token.clone();
    let mut watcher_task = tokio::spawn(async move { watcher.run(watcher_token).await });

    tracing::info!(
        secret = %options.name,
        namespace = %options.namespace,
        "starting certificate controller"
    );
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &options.namespace);
    let watch_config = KubeWatcherConfig::default()
        .fields(&format!("metadata.name={}", options.name))
        .timeout(WATCH_TIMEOUT_SECS);
    let ctx = Arc::new(Context::new(client, options).with_resync_interval(resync_interval));

    let controller = Controller::new(secrets, watch_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Secret"));

    let controller_stopped = tokio::select! {
        _ = controller => true,
        result = &mut watcher_task => {
            result??;
            false
        }
    };

    if controller_stopped {
        tracing::info!("certificate controller stopped");
        token.cancel();
        watcher_task.await??;
    }
    tracing::info!("ca watcher stopped");

    tracing::info!("certkeeper shutting down");
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received");
    token.cancel();
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
