//! `arstorplugin`: the ArStor CSI plugin process.
//!
//! Loads the configuration, checks the array, rebuilds the catalog from the
//! namespace, starts the lost loop device sweep and serves CSI over QUIC
//! until interrupted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use libarstor::exec::SystemRunner;
use libarstor::loopdev::LoopDeviceManager;
use libarstor::mounter::Mounter;
use libarstor::tool::{StorageTool, ToolCommand};
use libarstor::transport::server::CsiServer;
use libarstor::{ArStorBackend, ArStorConfig, VolumeEngine};

const NODE_ID_ENV: &str = "ARSTOR_NODE_ID";

#[derive(Parser, Debug, Default)]
#[command(name = "arstorplugin", version, about = "ArStor CSI plugin")]
struct Args {
    /// YAML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node identifier; falls back to $ARSTOR_NODE_ID.
    #[arg(long)]
    node_id: Option<String>,

    /// Where the array share is mounted.
    #[arg(long)]
    mount_point: Option<PathBuf>,

    #[arg(long)]
    shares: Option<String>,

    /// Mount the share one level deeper, at <mount_point>/<shares>.
    #[arg(long)]
    mount_hash_dir: bool,

    /// Docker container running the array tooling.
    #[arg(long)]
    container: Option<String>,

    #[arg(long)]
    driver_name: Option<String>,

    /// Publish volumes inline when the volume context does not say.
    #[arg(long)]
    ephemeral: Option<bool>,

    #[arg(long)]
    max_volumes_per_node: Option<u64>,

    /// QUIC listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    #[arg(long)]
    sweep_workers: Option<usize>,

    /// PEM certificate chain for the QUIC endpoint.
    #[arg(long, default_value = "/etc/arstor/tls.crt")]
    cert: PathBuf,

    /// PEM private key for the QUIC endpoint.
    #[arg(long, default_value = "/etc/arstor/tls.key")]
    key: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

/// Build the effective configuration: file, then flags, then environment.
fn load_config(args: &Args, env_node_id: Option<String>) -> Result<ArStorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => ArStorConfig::default(),
    };

    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    if config.node_id.is_empty()
        && let Some(node_id) = env_node_id
    {
        config.node_id = node_id;
    }
    if let Some(mount_point) = &args.mount_point {
        config.mount_point = mount_point.clone();
    }
    if let Some(shares) = &args.shares {
        config.shares = shares.clone();
    }
    if args.mount_hash_dir {
        config.mount_hash_dir = true;
    }
    if let Some(container) = &args.container {
        config.container = container.clone();
    }
    if let Some(driver_name) = &args.driver_name {
        config.driver_name = driver_name.clone();
    }
    if let Some(ephemeral) = args.ephemeral {
        config.ephemeral = ephemeral;
    }
    if let Some(max) = args.max_volumes_per_node {
        config.max_volumes_per_node = max;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(workers) = args.sweep_workers {
        config.sweep_workers = workers;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let chain = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("open certificate {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("parse private key {}", key.display()))?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("build TLS config")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = load_config(&args, std::env::var(NODE_ID_ENV).ok())?;
    info!(node_id = %config.node_id, driver = %config.driver_name, "ArStor CSI plugin starting");

    let root = config.prepare_namespace().await?;
    let runner = Arc::new(SystemRunner);
    let tool = Arc::new(ToolCommand::new(config.container.clone(), runner.clone()));
    tool.check_ready().await.context("array client is not ready")?;

    let engine = Arc::new(VolumeEngine::new(root, tool, config.backoff));
    let report = engine.scan().await?;
    info!(
        volumes = report.volumes,
        snapshots = report.snapshots,
        "catalog rebuilt from namespace"
    );

    let loops = Arc::new(LoopDeviceManager::new(runner.clone()));
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweepers =
        loops.run_detach_lost_loop_devices(config.sweep_workers, config.sweep_period(), stop_rx);

    let _ = rustls::crypto::ring::default_provider().install_default();
    let tls = load_tls(&args.cert, &args.key)?;
    let backend = Arc::new(ArStorBackend::new(
        engine,
        loops,
        Mounter::new(runner),
        &config,
    ));
    let server = CsiServer::new(config.listen, tls, backend)?;
    let endpoint = server.endpoint().clone();

    tokio::select! {
        served = server.serve() => served?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
    }

    let _ = stop_tx.send(true);
    endpoint.close(0u32.into(), b"shutdown");
    for handle in sweepers {
        if let Err(e) = handle.await {
            warn!(error = %e, "sweep worker panicked");
        }
    }
    endpoint.wait_idle().await;
    info!("ArStor CSI plugin stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arstor.yaml");
        std::fs::write(
            &path,
            "node_id: from-file\ncontainer: mxsp2\nsweep_workers: 4\nbackoff:\n  steps: 5\n",
        )
        .unwrap();

        let args = Args {
            config: Some(path),
            node_id: Some("from-flag".into()),
            ephemeral: Some(true),
            ..Default::default()
        };
        let config = load_config(&args, Some("from-env".into())).unwrap();
        assert_eq!(config.node_id, "from-flag");
        assert_eq!(config.container, "mxsp2");
        assert_eq!(config.sweep_workers, 4);
        assert_eq!(config.backoff.steps, 5);
        assert!(config.ephemeral);
    }

    #[test]
    fn env_fills_missing_node_id() {
        let config = load_config(&Args::default(), Some("node-7".into())).unwrap();
        assert_eq!(config.node_id, "node-7");
        assert!(load_config(&Args::default(), None).is_err());
    }

    #[test]
    fn bad_yaml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "sweep_workers: [many]\n").unwrap();
        let args = Args {
            config: Some(path),
            ..Default::default()
        };
        let err = load_config(&args, Some("n".into())).unwrap_err();
        assert!(err.to_string().contains("parse config"));
    }

    #[test]
    fn cli_parses() {
        let args = Args::try_parse_from([
            "arstorplugin",
            "--node-id",
            "n1",
            "--listen",
            "127.0.0.1:9000",
            "--ephemeral",
            "false",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(args.node_id.as_deref(), Some("n1"));
        assert_eq!(args.ephemeral, Some(false));
        assert!(args.log_json);
        assert_eq!(args.cert, PathBuf::from("/etc/arstor/tls.crt"));
    }
}
