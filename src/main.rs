mod config;
mod control;
mod daemon;
mod error;
mod join;
mod keys;
mod model;
mod netlink;
mod resolver;
mod session;
mod state;
mod sync;
#[cfg(test)]
mod testing;
mod tunnel;
mod uapi;
mod wg;

use anyhow::{anyhow, Context as _, Result};
use clap::{ArgAction, Parser, Subcommand};
use config::{default_config_path, load_config, save_config, AgentConfig, ServerConfig};
use control::ControlClient;
use daemon::{systemd_available, DaemonManager, NoopDaemon, SystemdDaemon};
use ipnet::IpNet;
use join::{JoinOptions, JoinOutcome};
use keys::FileSecretStore;
use resolver::{HttpEcho, NetlinkHost};
use session::{Context, NetworkSession};
use state::{ConfigStore, FileConfigStore, NetworkConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tunnel::TunnelManager;

#[derive(Parser, Debug)]
#[command(name = "meshnode", about = "Mesh VPN node agent")]
struct Args {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this host with a network and bring its interface up.
    Join(JoinArgs),
    /// Leave a network and remove everything it installed locally.
    Leave {
        #[arg(short, long)]
        network: String,
    },
    /// Run one synchronization pass for a network, or for all of them.
    Pull {
        #[arg(short, long)]
        network: Option<String>,
    },
    /// Show joined networks.
    List,
    /// Install the background service for an already joined network.
    Install {
        #[arg(short, long)]
        network: String,
    },
    /// Leave every joined network.
    Uninstall,
    /// Show listen ports of active tunnel interfaces.
    Ports,
    /// Keep networks synchronized until interrupted.
    Daemon {
        #[arg(short, long, value_name = "NETWORK", action = ArgAction::Append)]
        network: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct JoinArgs {
    #[arg(short, long)]
    network: String,
    #[arg(
        long,
        value_name = "URL",
        value_delimiter = ',',
        action = ArgAction::Append
    )]
    control_url: Vec<String>,
    #[arg(long, env = "MESHNODE_ACCESS_KEY")]
    access_key: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_name = "PATH")]
    private_key_file: Option<PathBuf>,
    #[arg(long, env = "MESHNODE_PASSWORD")]
    password: Option<String>,
    #[arg(long, value_name = "CIDR")]
    local_range: Option<IpNet>,
    #[arg(long)]
    local_address: Option<IpAddr>,
    #[arg(long)]
    local: bool,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    keepalive: Option<u16>,
    #[arg(long)]
    interface: Option<String>,
    #[arg(long)]
    pre_up: Option<String>,
    #[arg(long)]
    post_up: Option<String>,
    #[arg(long)]
    pre_down: Option<String>,
    #[arg(long)]
    post_down: Option<String>,
    #[arg(long)]
    no_daemon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AgentConfig::default(),
    };
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| config.data_dir())
        .ok_or_else(|| anyhow!("no data directory available; pass --data-dir"))?;

    if let Command::List = &args.command {
        return list_networks(&FileConfigStore::new(&data_dir));
    }

    let ctx = build_context(&config, config_path.as_ref(), data_dir)?;
    match &args.command {
        Command::Join(join) => run_join(&config, config_path.as_ref(), ctx, join).await?,
        Command::Leave { network } => run_leave(&config, ctx, network).await?,
        Command::Pull { network } => run_pull(&config, ctx, network.as_deref()).await?,
        Command::List => {}
        Command::Install { network } => run_install(ctx, network).await?,
        Command::Uninstall => run_uninstall(&config, ctx).await?,
        Command::Ports => {
            for port in ctx.tunnels.active_listen_ports().await? {
                println!("{port}");
            }
        }
        Command::Daemon { network } => run_daemon(&config, ctx, network).await?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_filter = if verbose { "meshnode=debug" } else { "meshnode=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_context(
    config: &AgentConfig,
    config_path: Option<&PathBuf>,
    data_dir: PathBuf,
) -> Result<Arc<Context>> {
    let daemon: Arc<dyn DaemonManager> = if config.daemon && systemd_available() {
        Arc::new(SystemdDaemon::new(config_path.cloned())?)
    } else {
        Arc::new(NoopDaemon)
    };
    let driver = wg::select_driver(config.backend)?;
    info!(backend = driver.backend(), "tunnel driver selected");
    Ok(Arc::new(Context {
        store: Arc::new(FileConfigStore::new(&data_dir)),
        secrets: Arc::new(FileSecretStore::new(&data_dir)),
        daemon,
        host: Arc::new(NetlinkHost),
        echo: Arc::new(HttpEcho::new()?),
        tunnels: Arc::new(TunnelManager::new(driver, data_dir.join("run"))),
        public_ip_services: config.public_ip_services.clone(),
        base_port: config.base_port,
    }))
}

/// The record's own control settings, filled in from the agent config.
fn server_for(record: &NetworkConfig, config: &AgentConfig) -> ServerConfig {
    let mut server = record.server.clone();
    if server.control_urls.is_empty() {
        server.control_urls = config.control_urls.clone();
    }
    if server.access_key.is_none() {
        server.access_key = config.access_key.clone();
    }
    server
}

fn open_session(
    config: &AgentConfig,
    ctx: &Arc<Context>,
    record: &NetworkConfig,
) -> Result<NetworkSession> {
    let client = ControlClient::new(&server_for(record, config))
        .with_context(|| format!("network {}", record.network))?;
    Ok(NetworkSession::new(&record.network, Arc::new(client), ctx.clone()))
}

fn read_record(ctx: &Context, network: &str) -> Result<NetworkConfig> {
    ctx.store
        .read(network)?
        .ok_or_else(|| error::Error::NotInstalled(network.to_string()).into())
}

async fn run_join(
    config: &AgentConfig,
    config_path: Option<&PathBuf>,
    ctx: Arc<Context>,
    args: &JoinArgs,
) -> Result<()> {
    let control_urls = if args.control_url.is_empty() {
        config.control_urls.clone()
    } else {
        args.control_url.clone()
    };
    if control_urls.is_empty() {
        return Err(anyhow!("control URL not set; pass --control-url or set control_urls"));
    }
    let server = ServerConfig {
        control_urls,
        access_key: args.access_key.clone().or_else(|| config.access_key.clone()),
    };
    let private_key = args
        .private_key_file
        .as_deref()
        .map(keys::read_private_key_file)
        .transpose()?;
    let options = JoinOptions {
        server: server.clone(),
        node_name: args.name.clone(),
        private_key,
        password: args.password.clone(),
        local_range: args.local_range,
        local_address: args.local_address,
        is_local: args.local,
        endpoint: args.endpoint.clone(),
        listen_port: args.port,
        keepalive: args.keepalive,
        interface: args.interface.clone(),
        pre_up: args.pre_up.clone(),
        post_up: args.post_up.clone(),
        pre_down: args.pre_down.clone(),
        post_down: args.post_down.clone(),
        daemon: config.daemon && !args.no_daemon,
        defer_interface: !ctx.tunnels.outlives_process(),
    };

    let client = ControlClient::new(&server)?;
    let mut session = NetworkSession::new(&args.network, Arc::new(client), ctx);
    let outcome = session.join(&options).await;
    session.close().await;
    let outcome = outcome?;
    if config.control_urls.is_empty() {
        if let Some(path) = config_path {
            let mut updated = config.clone();
            updated.control_urls = server.control_urls.clone();
            save_config(path, &updated)
                .with_context(|| format!("failed to save config {}", path.display()))?;
        }
    }
    let node = outcome.node();
    match &outcome {
        JoinOutcome::Pending(_) => println!(
            "registered with network {} as {}; waiting for approval",
            args.network, node.name
        ),
        JoinOutcome::Deferred(_) => println!(
            "registered with network {}; interface {} comes up once `meshnode daemon` runs",
            args.network, node.interface
        ),
        JoinOutcome::Connected(_) => println!(
            "joined network {} on {} (port {}, endpoint {})",
            args.network, node.interface, node.listen_port, node.endpoint
        ),
    }
    Ok(())
}

async fn run_leave(config: &AgentConfig, ctx: Arc<Context>, network: &str) -> Result<()> {
    let record = read_record(&ctx, network)?;
    let mut session = open_session(config, &ctx, &record)?;
    let outcome = session.leave().await?;
    if !outcome.cleanup_failures.is_empty() {
        println!(
            "left network {network}; some local cleanup failed: {}",
            outcome.cleanup_failures.join(", ")
        );
    } else if outcome.remote_deregistered {
        println!("left network {network}");
    } else {
        println!("left network {network} locally; the control plane could not be reached");
    }
    Ok(())
}

async fn run_pull(config: &AgentConfig, ctx: Arc<Context>, network: Option<&str>) -> Result<()> {
    if !ctx.tunnels.outlives_process() {
        return Err(anyhow!(
            "the userspace backend keeps interfaces only while `meshnode daemon` runs; start the daemon instead of pulling"
        ));
    }
    let networks = match network {
        Some(network) => vec![network.to_string()],
        None => ctx.store.list_networks()?,
    };
    let mut failed = 0usize;
    for network in &networks {
        match pull_one(config, &ctx, network).await {
            Ok(node) => println!("pulled {network}: interface {}", node.interface),
            Err(err) => {
                warn!(network = %network, error = %err, "pull failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} networks failed to sync", networks.len()));
    }
    Ok(())
}

async fn pull_one(config: &AgentConfig, ctx: &Arc<Context>, network: &str) -> Result<model::Node> {
    let record = read_record(ctx, network)?;
    let mut session = open_session(config, ctx, &record)?;
    let result = session.sync(&record.node).await;
    session.close().await;
    Ok(result?)
}

fn list_networks(store: &FileConfigStore) -> Result<()> {
    let networks = store.list_networks()?;
    if networks.is_empty() {
        println!("no networks joined");
        return Ok(());
    }
    for network in networks {
        let Some(record) = store.read(&network)? else {
            continue;
        };
        let node = &record.node;
        let address = node
            .address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = if node.is_pending {
            "pending"
        } else if record.stale {
            "stale"
        } else {
            "ok"
        };
        println!(
            "{network}\t{}\t{address}\t{}:{}\t{status}",
            node.interface, node.endpoint, node.listen_port
        );
    }
    Ok(())
}

async fn run_install(ctx: Arc<Context>, network: &str) -> Result<()> {
    read_record(&ctx, network)?;
    if ctx.daemon.is_installed(network).await? {
        return Err(error::Error::AlreadyInstalled(network.to_string()).into());
    }
    ctx.daemon.install(network).await?;
    println!("installed daemon for network {network}");
    Ok(())
}

async fn run_uninstall(config: &AgentConfig, ctx: Arc<Context>) -> Result<()> {
    let networks = ctx.store.list_networks()?;
    for network in &networks {
        let result = async {
            let record = read_record(&ctx, network)?;
            let mut session = open_session(config, &ctx, &record)?;
            session.leave().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        match result {
            Ok(()) => println!("left network {network}"),
            Err(err) => warn!(network = %network, error = %err, "failed to leave network"),
        }
    }
    println!("uninstalled {} networks", networks.len());
    Ok(())
}

async fn run_daemon(config: &AgentConfig, ctx: Arc<Context>, requested: &[String]) -> Result<()> {
    let networks = if requested.is_empty() {
        ctx.store.list_networks()?
    } else {
        requested.to_vec()
    };
    if networks.is_empty() {
        return Err(anyhow!("no networks joined"));
    }
    let interval = Duration::from_secs(config.sync_interval_seconds.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for network in networks {
        let record = read_record(&ctx, &network)?;
        let session = open_session(config, &ctx, &record)?;
        tasks.push(tokio::spawn(sync_loop(session, interval, shutdown_rx.clone())));
    }
    info!(networks = tasks.len(), "daemon running");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "sync task ended abnormally");
        }
    }
    Ok(())
}

/// Periodic passes for one network. A pass in progress finishes before
/// shutdown is observed.
async fn sync_loop(mut session: NetworkSession, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let network = session.network().to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let record = match read_record(&session.ctx, &network) {
                    Ok(record) => record,
                    Err(err) => {
                        info!(network = %network, error = %err, "network no longer joined, stopping");
                        break;
                    }
                };
                if let Err(err) = session.sync(&record.node).await {
                    warn!(network = %network, error = %err, "sync failed");
                }
            }
        }
    }
    session.close().await;
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    }

    let _ = tokio::signal::ctrl_c().await;
}
