//! # rkreflink
//!
//! Node agent and catalog aggregator for copy-on-write local volumes.
//!
//! ## Roles
//!
//! - **worker** (default): reconciles claims, snapshots and garbage on this
//!   node and reports its dataset catalog to the aggregator every pass.
//! - **aggregator**: serves the merged, freshness-filtered catalog of all
//!   workers.
//!
//! ## Usage
//!
//! ```bash
//! # Worker on this node
//! NODE=node-a rkreflink --config /etc/reflink/conf.yml
//!
//! # Aggregator
//! rkreflink --config /etc/reflink/conf.yml --role aggregator --listen 0.0.0.0:8080
//!
//! # One pass against an empty in-memory store, touching nothing on disk
//! rkreflink --config conf.yml --dry-run --once
//! ```

mod dry_run;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, ValueEnum};
use libreflink::transport::server::{self, CatalogServer};
use libreflink::transport::ReportClient;
use libreflink::{
    AggregatorCache, ApiServerStore, ClusterStore, Context, HostSet, MemoryStore,
    ProvisionerConfig, Reconciler, Role,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dry_run::DryRunExec;
use crate::logging::{LogFormat, init_logging};

/// Legacy switch selecting the aggregator role when set to `true`.
const LEGACY_AGGREGATOR_ENV: &str = "REFLINKMASTER";

/// Copy-on-write local volume provisioner.
#[derive(Debug, Parser)]
#[command(name = "rkreflink")]
#[command(about = "Provisions reflink-cloned local volumes and aggregates dataset catalogs")]
#[command(version)]
struct Args {
    /// YAML configuration file.
    #[arg(long, env = "REFLINK_CONFIG", default_value = "conf.yml")]
    config: PathBuf,

    /// Process role.  Overrides the config file.
    #[arg(long, env = "REFLINK_ROLE", value_enum)]
    role: Option<RoleArg>,

    /// Node identity used in volume affinity and catalog reports.
    #[arg(long, env = "NODE")]
    node_name: Option<String>,

    /// Listen address of the catalog server.  Overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Use an empty in-memory store and never clone or remove anything.
    #[arg(long)]
    dry_run: bool,

    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    once: bool,

    /// Log output format.
    #[arg(long, env = "REFLINK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Worker,
    Aggregator,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Worker => Role::Worker,
            RoleArg::Aggregator => Role::Aggregator,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let mut cfg = ProvisionerConfig::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let legacy_aggregator = std::env::var(LEGACY_AGGREGATOR_ENV).ok();
    apply_overrides(&mut cfg, &args, legacy_aggregator.as_deref());
    cfg.validate().context("invalid configuration")?;

    let shutdown = shutdown_channel();
    match cfg.role {
        Role::Aggregator => run_aggregator(cfg, shutdown).await,
        Role::Worker => run_worker(cfg, &args, shutdown).await,
    }
}

/// Fold command-line and environment overrides into `cfg`.
fn apply_overrides(cfg: &mut ProvisionerConfig, args: &Args, legacy_aggregator: Option<&str>) {
    if let Some(role) = args.role {
        cfg.role = role.into();
    } else if legacy_aggregator.is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        cfg.role = Role::Aggregator;
    }
    if let Some(node) = &args.node_name {
        cfg.node_name = Some(node.clone());
    }
    if let Some(listen) = &args.listen {
        cfg.listen_addr = listen.clone();
    }
}

fn resolve_node_name(cfg: &ProvisionerConfig) -> Result<String> {
    if let Some(node) = cfg.node_name.as_ref().filter(|n| !n.is_empty()) {
        return Ok(node.clone());
    }
    let host = nix::unistd::gethostname().context("reading hostname")?;
    match host.into_string() {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => bail!("node name not configured and hostname unusable; set NODE"),
    }
}

async fn run_aggregator(cfg: ProvisionerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", cfg.listen_addr))?;
    let cache = Arc::new(AggregatorCache::new(cfg.freshness_window()));
    let (bound, serving) = server::bind(
        addr,
        Arc::new(CatalogServer::aggregator(cache)),
        wait_for(shutdown),
    )
    .context("starting aggregator listener")?;
    info!(addr = %bound, window = ?cfg.freshness_window(), "aggregator running");
    serving.await.context("aggregator listener failed")?;
    info!("aggregator stopped");
    Ok(())
}

async fn run_worker(
    cfg: ProvisionerConfig,
    args: &Args,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let node = resolve_node_name(&cfg)?;

    let store: Arc<dyn ClusterStore> = if args.dry_run {
        warn!("dry-run: using an empty in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let api = ApiServerStore::new(cfg.api_server.clone())?;
        api.ping()
            .await
            .with_context(|| format!("reaching api server {}", cfg.api_server))?;
        Arc::new(api)
    };

    let mut hosts = HostSet::from_config(&cfg, &node)?;
    if args.dry_run {
        hosts = DryRunExec::wrap(&hosts)?;
    }
    info!(
        node = %node,
        hosts = hosts.len(),
        root = %cfg.root_path.display(),
        snapshots = %cfg.snapshot_path.display(),
        class = %cfg.storage_class,
        "worker starting",
    );

    let reporter = if args.dry_run {
        None
    } else {
        Some(ReportClient::new(&cfg.aggregator_url, cfg.report_timeout())?)
    };

    let local_catalog = if cfg.serve_local_catalog && !args.once {
        let addr: SocketAddr = cfg
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", cfg.listen_addr))?;
        let cache = Arc::new(AggregatorCache::new(cfg.freshness_window()));
        let (_, serving) = server::bind(
            addr,
            Arc::new(CatalogServer::read_only(Arc::clone(&cache))),
            wait_for(shutdown.clone()),
        )
        .context("starting local catalog listener")?;
        tokio::spawn(async move {
            if let Err(e) = serving.await {
                warn!(error = %e, "local catalog listener failed");
            }
        });
        Some(cache)
    } else {
        None
    };

    let ctx = Context::new(cfg, store, hosts)?;
    let mut reconciler = Reconciler::new(ctx);
    if let Some(reporter) = reporter {
        reconciler = reconciler.with_reporter(reporter);
    }
    if let Some(cache) = local_catalog {
        reconciler = reconciler.with_local_catalog(cache);
    }

    if args.once {
        let summary = reconciler.run_pass().await;
        if summary.errors > 0 {
            warn!(errors = summary.errors, "pass finished with errors");
        }
        return Ok(());
    }
    reconciler.run(wait_for(shutdown)).await;
    Ok(())
}

/// A receiver that flips to `true` on SIGINT or SIGTERM.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot watch SIGTERM, only ctrl-c stops the process"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rkreflink"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn cfg() -> ProvisionerConfig {
        ProvisionerConfig::new("/data/volumes", "/data/snapshots", "reflink")
    }

    #[test]
    fn legacy_env_selects_aggregator() {
        let mut c = cfg();
        apply_overrides(&mut c, &args(&[]), Some("true"));
        assert_eq!(c.role, Role::Aggregator);

        let mut c = cfg();
        apply_overrides(&mut c, &args(&[]), Some("false"));
        assert_eq!(c.role, Role::Worker);
    }

    #[test]
    fn explicit_role_beats_legacy_env() {
        let mut c = cfg();
        apply_overrides(&mut c, &args(&["--role", "worker"]), Some("true"));
        assert_eq!(c.role, Role::Worker);
    }

    #[test]
    fn flags_override_file_values() {
        let mut c = cfg();
        c.node_name = Some("from-file".into());
        apply_overrides(
            &mut c,
            &args(&["--node-name", "node-b", "--listen", "127.0.0.1:9000"]),
            None,
        );
        assert_eq!(c.node_name.as_deref(), Some("node-b"));
        assert_eq!(c.listen_addr, "127.0.0.1:9000");
        assert_eq!(resolve_node_name(&c).unwrap(), "node-b");
    }

    #[tokio::test]
    async fn wait_for_returns_once_flipped() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for(rx));
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
