//! extsvcd — keeps a node's external services registered in Consul.
//!
//! # Usage
//!
//! ```text
//! extsvcd start --node node1
//! extsvcd status --node node1
//! extsvcd export --file backup.yaml
//! extsvcd --consul-addr 10.0.0.2:8500 import --file backup.yaml
//! ```
//!
//! Settings come from an optional TOML file (`--config`); flags override it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use extsvc_backend::{AgentApi, Backend, ConsulBackend};
use extsvc_watcher::ExtsvcConfig;
use tracing::{debug, info};

mod daemon;
mod status;

const DEFAULT_LOG_FILTER: &str = "info,extsvcd=debug,extsvc_watcher=debug";

#[derive(Parser)]
#[command(
    name = "extsvcd",
    about = "External service watcher for Consul",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to an extsvc.toml file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Consul agent address (host:port).
    #[arg(long, global = true, env = "CONSUL_HTTP_ADDR")]
    consul_addr: Option<String>,

    /// ACL token sent with every request.
    #[arg(long, global = true, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Datacenter to query instead of the agent's own.
    #[arg(long, global = true)]
    datacenter: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watcher for a node until interrupted.
    Start {
        /// Node whose external services this process manages.
        #[arg(long)]
        node: Option<String>,

        /// How often leadership is re-evaluated (e.g. "10s").
        #[arg(long)]
        poll_interval: Option<String>,

        /// Upper bound of each blocking query (e.g. "3s").
        #[arg(long)]
        wait_time: Option<String>,
    },
    /// Write every service definition to a YAML file.
    Export {
        #[arg(long)]
        file: PathBuf,
    },
    /// Load service definitions from a YAML file written by `export`.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show the definitions of a node with their check and catalog state.
    Status {
        #[arg(long)]
        node: Option<String>,
    },
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Version => {
            println!("extsvcd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Start {
            node,
            poll_interval,
            wait_time,
        } => {
            override_field(&mut config.watcher.node, node);
            override_field(&mut config.watcher.leadership_poll, poll_interval);
            override_field(&mut config.watcher.wait_time, wait_time);
            let node = node_name(&config)?;
            let watcher_config = config.watcher_config()?;
            let backend = connect(&config).await?;
            daemon::run(backend, node, watcher_config).await
        }
        Command::Export { file } => {
            let backend = connect(&config).await?;
            let count = extsvc_watcher::export_definitions(backend.as_ref(), &file).await?;
            println!("exported {count} definitions to {}", file.display());
            Ok(())
        }
        Command::Import { file } => {
            let backend = connect(&config).await?;
            let count = extsvc_watcher::import_definitions(backend.as_ref(), &file).await?;
            println!("imported {count} definitions from {}", file.display());
            Ok(())
        }
        Command::Status { node } => {
            override_field(&mut config.watcher.node, node);
            let node = node_name(&config)?;
            let backend = connect(&config).await?;
            let rows = status::collect(backend, &node).await?;
            print!("{}", status::render(&node, &rows));
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// The config file (if any) with the global flags applied on top.
fn load_config(cli: &Cli) -> anyhow::Result<ExtsvcConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config_file(path)?,
        None => ExtsvcConfig::default(),
    };
    override_field(&mut config.backend.address, cli.consul_addr.clone());
    override_field(&mut config.backend.token, cli.token.clone());
    override_field(&mut config.backend.datacenter, cli.datacenter.clone());
    Ok(config)
}

fn read_config_file(path: &Path) -> anyhow::Result<ExtsvcConfig> {
    let config = ExtsvcConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    debug!(path = %path.display(), "config loaded");
    Ok(config)
}

fn override_field(field: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *field = value;
    }
}

fn node_name(config: &ExtsvcConfig) -> anyhow::Result<String> {
    config
        .watcher
        .node
        .clone()
        .filter(|node| !node.is_empty())
        .context("no node given: pass --node or set watcher.node in the config file")
}

/// Build the Consul client and make sure the agent answers.
async fn connect(config: &ExtsvcConfig) -> anyhow::Result<Arc<dyn Backend>> {
    let consul = config.consul_config()?;
    let address = consul.address.clone();
    let backend = ConsulBackend::new(consul)?;
    let agent = backend
        .agent_node_name()
        .await
        .with_context(|| format!("cannot reach consul agent at {address}"))?;
    info!(%address, %agent, "connected to consul agent");
    Ok(Arc::new(backend))
}
