use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use keel_core::{UpgraderConfig, DEFAULT_NAMESPACE};
use keel_kubehub::{KubeCluster, UpgradeContext};
use keel_runner::{Runner, WORKFLOW_NAMES};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keel-upgrader", version, about = "Sensor self-upgrader")]
struct Cli {
    /// Workflow to run: roll-forward, dry-run, validate-bundle, rollback or cleanup
    #[arg(short = 'w', long = "workflow", env = "KEEL_WORKFLOW", default_value = "dry-run")]
    workflow: String,

    /// Identifies this upgrade attempt; generated when absent
    #[arg(long = "process-id", env = "KEEL_UPGRADE_PROCESS_ID")]
    process_id: Option<String>,

    #[arg(long = "cluster-id", env = "KEEL_CLUSTER_ID", default_value = "")]
    cluster_id: String,

    /// Agent namespace
    #[arg(long = "ns", env = "KEEL_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Directory or .tar.gz bundle to upgrade to
    #[arg(long = "local-bundle", env = "KEEL_LOCAL_BUNDLE")]
    local_bundle: Option<PathBuf>,

    /// Only rotate certificates; leave every other object alone
    #[arg(long = "cert-rotation-only", env = "KEEL_CERT_ROTATION_ONLY", action = ArgAction::SetTrue)]
    cert_rotation_only: bool,

    /// Name of the upgrader's own Deployment, removed by cleanup and rollback
    #[arg(long = "owner", env = "KEEL_OWNER")]
    owner: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long = "request-timeout", env = "KEEL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Upper bound for waiting on the owner's deletion, in seconds
    #[arg(long = "deletion-wait", env = "KEEL_DELETION_WAIT_SECS", default_value_t = 300)]
    deletion_wait_secs: u64,

    /// Final status output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

impl Cli {
    fn config(&self) -> UpgraderConfig {
        let process_id = match &self.process_id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!(process_id = %id, "no process id given; generated one");
                id
            }
        };
        let mut cfg = UpgraderConfig::new(process_id, self.namespace.clone());
        cfg.cluster_id = self.cluster_id.clone();
        cfg.cert_rotation_only = self.cert_rotation_only;
        cfg.local_bundle = self.local_bundle.clone();
        cfg.request_timeout = Duration::from_secs(self.request_timeout_secs);
        cfg.deletion_wait = Duration::from_secs(self.deletion_wait_secs);
        cfg.owner = self.owner.as_deref().map(|name| cfg.owner_deployment(name));
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; cancelling"),
                        _ = term.recv() => info!("SIGTERM received; cancelling"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C cancels");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl-C received; cancelling");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received; cancelling");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if keel_runner::workflow_stages(&cli.workflow).is_none() {
        anyhow::bail!("unknown workflow {:?}; expected one of {}", cli.workflow, WORKFLOW_NAMES.join(", "));
    }

    let cfg = cli.config();
    info!(
        workflow = %cli.workflow,
        process_id = %cfg.process_id,
        cluster_id = %cfg.cluster_id,
        namespace = %cfg.namespace,
        cert_rotation_only = cfg.cert_rotation_only,
        "starting upgrader"
    );

    let cluster = KubeCluster::try_default().await.context("connecting to the cluster")?;
    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let runner = Runner::new(UpgradeContext::new(cfg, Arc::new(cluster), cancel));

    let res = runner.run(&cli.workflow).await;
    let status = runner.status();
    match cli.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        Output::Human => {
            let stage = status.last_stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
            println!("{} • last stage {} • {}", cli.workflow, stage, if status.finished { "finished" } else { "stopped" });
        }
    }
    if let Err(e) = res {
        error!(error = %e, "upgrader failed");
        return Err(e.into());
    }
    Ok(())
}
