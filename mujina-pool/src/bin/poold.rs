use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ruint::aliases::U256;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use mujina_pool::config::{Config, HostKind, NodeConfig};
use mujina_pool::hostpool::http::HttpTransport;
use mujina_pool::hostpool::tcp::TcpTransport;
use mujina_pool::hostpool::{HostPool, Transport, DEFAULT_PROBE_TIMEOUT};
use mujina_pool::node::eth::{self, EthNode};
use mujina_pool::node::nexa::{self, NexaNode};
use mujina_pool::node::pow::PowRegistry;
use mujina_pool::node::MiningNode;
use mujina_pool::pool::{Collaborators, Pool};
use mujina_pool::tracing::{self, prelude::*};

/// Environment variable naming the config file when no argument is given.
const CONFIG_ENV: &str = "MUJINA_POOL_CONFIG";

fn config_path() -> Result<String> {
    if let Some(path) = env::args().nth(1) {
        return Ok(path);
    }
    env::var(CONFIG_ENV)
        .with_context(|| format!("usage: mujina-poold <config.toml> (or set {CONFIG_ENV})"))
}

fn build_node(config: &NodeConfig) -> Result<Arc<dyn MiningNode>> {
    let chain = config.chain.to_ascii_uppercase();
    let probe = match chain.as_str() {
        "NEXA" => nexa::probe(),
        "ETH" | "ETC" => eth::probe(),
        other => bail!("no adapter for chain {other}"),
    };

    let hosts = Arc::new(HostPool::new(probe, DEFAULT_PROBE_TIMEOUT));
    for host in &config.hosts {
        let transport: Box<dyn Transport> = match host.kind {
            HostKind::Http => {
                let mut http = HttpTransport::new(&host.url)?;
                if let Some(user) = &host.username {
                    http = http.basic_auth(user, host.password.clone());
                }
                Box::new(http)
            }
            HostKind::Tcp => Box::new(TcpTransport::new(&host.url, hosts.notify_sender())),
        };
        hosts.add(transport, host.enabled);
    }

    let pow = PowRegistry::create(&chain)?;
    let share_difficulty = U256::from(config.share_difficulty);
    let node: Arc<dyn MiningNode> = if chain == "NEXA" {
        Arc::new(NexaNode::new(hosts, pow, share_difficulty, config.refresh())?)
    } else {
        Arc::new(EthNode::new(chain, hosts, pow, share_difficulty, config.refresh())?)
    };
    Ok(node)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let path = config_path()?;
    let config = Config::load_from(&path).with_context(|| format!("loading {path}"))?;
    let node = build_node(&config.node)?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let pool = Pool::new(config.pool, node, Collaborators::in_memory(), running.clone())?;
    tracker.spawn({
        let running = running.clone();
        async move {
            if let Err(e) = pool.run().await {
                error!(error = %e, "Pool failed.");
                running.cancel();
            }
        }
    });
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
