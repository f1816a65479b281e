use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use compute_cluster::cluster::gossip::GossipService;
use compute_cluster::cluster::types::NodeId;
use compute_cluster::compute::handlers::{
    ComputeApi, ENDPOINT_STATUS, ENDPOINT_SUBMIT, ENDPOINT_TASK, handle_get_task, handle_status,
    handle_submit,
};
use compute_cluster::compute::master::ComputeMaster;
use compute_cluster::compute::node::ComputeNode;
use compute_cluster::compute::payloads::{PayloadRegistry, TaskScope};
use compute_cluster::compute::slave::ComputeSlave;
use compute_cluster::compute::types::{ComputeGroup, ComputeRole};
use compute_cluster::config::{ComputeConfig, DEFAULT_MAX_QUEUE_DEPTH};
use compute_cluster::directory::{
    Directory, ENDPOINT_DIRECTORY, HttpDirectory, LocalDirectory, handle_get_entry,
    handle_put_entry,
};
use compute_cluster::net::http::{HttpNetwork, handle_message};
use compute_cluster::net::protocol::ENDPOINT_MESSAGE;
use compute_cluster::sync::http::{
    ENDPOINT_BARRIER_RESIZE, ENDPOINT_BARRIER_SIGN_ON, HttpBarrierService, handle_resize,
    handle_sign_on,
};
use compute_cluster::sync::table::BarrierTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Offset between the gossip (UDP) port and the HTTP port of a node.
const HTTP_PORT_OFFSET: u16 = 1000;

#[derive(Parser, Debug)]
#[command(name = "compute-node", about = "Master/slave compute group node")]
struct Cli {
    /// Gossip address; HTTP listens on the same host, port + 1000
    #[arg(long, env = "COMPUTE_BIND")]
    bind: SocketAddr,

    /// Gossip address of a node already in the cluster (repeatable)
    #[arg(long = "seed", env = "COMPUTE_SEEDS", value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    #[arg(long, env = "COMPUTE_ROLE", value_enum, default_value_t = ComputeRole::Slave)]
    role: ComputeRole,

    #[arg(long, env = "COMPUTE_GROUP", default_value_t = 0)]
    group: ComputeGroup,

    /// HTTP address of the directory host. Without it this node hosts the directory.
    #[arg(long, env = "COMPUTE_DIRECTORY")]
    directory: Option<SocketAddr>,

    #[arg(long, env = "COMPUTE_MAX_QUEUE_DEPTH", default_value_t = DEFAULT_MAX_QUEUE_DEPTH)]
    max_queue_depth: usize,

    #[arg(long, env = "COMPUTE_PING_INTERVAL_MS", default_value_t = 1_000)]
    ping_interval_ms: u64,

    #[arg(long, env = "COMPUTE_REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    request_timeout_ms: u64,

    /// Longest wait of a rendezvous on barriers this node owns. Unset waits forever.
    #[arg(long, env = "COMPUTE_BARRIER_TIMEOUT_MS")]
    barrier_timeout_ms: Option<u64>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, env = "COMPUTE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> ComputeConfig {
        ComputeConfig {
            max_queue_depth: self.max_queue_depth,
            ping_interval_ms: self.ping_interval_ms,
            request_timeout_ms: self.request_timeout_ms,
            barrier_timeout_ms: self.barrier_timeout_ms,
            ..ComputeConfig::new(self.role, self.group)
        }
    }
}

enum RunningNode {
    Master(ComputeNode<ComputeMaster>),
    Slave(ComputeNode<ComputeSlave>),
}

impl RunningNode {
    async fn shutdown(&self) {
        match self {
            RunningNode::Master(node) => node.shutdown().await,
            RunningNode::Slave(node) => node.shutdown().await,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = cli.config();
    config.validate()?;

    let http_addr = SocketAddr::new(cli.bind.ip(), cli.bind.port() + HTTP_PORT_OFFSET);
    let node_id = NodeId::new();
    tracing::info!("Starting compute {} {} (group {})", config.role, node_id, config.group);

    // 1. Liveness and addressing (UDP gossip):
    let gossip = GossipService::new(node_id.clone(), cli.bind, http_addr, cli.seeds.clone()).await?;
    gossip.clone().start().await;

    // 2. Transport, barriers, directory:
    let network = HttpNetwork::new(node_id.clone(), gossip.clone(), config.request_timeout());
    let barrier_table = BarrierTable::new(node_id.clone(), config.barrier_timeout());
    let barriers = HttpBarrierService::new(node_id.clone(), barrier_table.clone(), gossip.clone());

    let (directory, hosted_directory): (Arc<dyn Directory>, Option<Arc<LocalDirectory>>) =
        match cli.directory {
            Some(host) => {
                let remote: Arc<dyn Directory> = HttpDirectory::new(host, config.request_timeout());
                (remote, None)
            }
            None => {
                let local = LocalDirectory::new();
                let shared: Arc<dyn Directory> = local.clone();
                (shared, Some(local))
            }
        };

    // 3. Compute node in its role:
    let (running, api): (RunningNode, Arc<dyn ComputeApi>) = match config.role {
        ComputeRole::Master => {
            let master = ComputeMaster::new(
                config.clone(),
                network.clone(),
                barriers,
                directory,
                gossip.clone(),
            )
            .await?;
            let api: Arc<dyn ComputeApi> = master.clone();
            (RunningNode::Master(ComputeNode::start(master)), api)
        }
        ComputeRole::Slave => {
            let slave = ComputeSlave::new(
                config.clone(),
                network.clone(),
                barriers,
                directory,
                gossip.clone(),
                builtin_payloads(),
            )?;
            let api: Arc<dyn ComputeApi> = slave.clone();
            (RunningNode::Slave(ComputeNode::start(slave)), api)
        }
    };

    // 4. HTTP Router:
    let mut app = Router::new()
        .route(ENDPOINT_MESSAGE, post(handle_message))
        .route(ENDPOINT_BARRIER_SIGN_ON, post(handle_sign_on))
        .route(ENDPOINT_BARRIER_RESIZE, post(handle_resize))
        .route(ENDPOINT_SUBMIT, post(handle_submit))
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(&format!("{}/:id", ENDPOINT_TASK), get(handle_get_task))
        .layer(Extension(network))
        .layer(Extension(barrier_table))
        .layer(Extension(api.clone()));

    if let Some(local) = hosted_directory {
        tracing::info!("Hosting the directory on {}", http_addr);
        app = app
            .route(
                &format!("{}/:key", ENDPOINT_DIRECTORY),
                get(handle_get_entry).put(handle_put_entry),
            )
            .layer(Extension(local));
    }

    // 5. Spawn status reporter:
    let reporter = api.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let status = reporter.status().await;
            tracing::info!(
                "Compute status: {:?} master={:?} queued={:?} processed={:?} slaves={}",
                status.state,
                status.master.map(|id| id.to_string()),
                status.queue_depth,
                status.tasks_processed,
                status.slaves.len()
            );
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Listening for Ctrl+C failed: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down compute node");
    running.shutdown().await;

    Ok(())
}

/// Payloads every slave of this binary can run.
fn builtin_payloads() -> Arc<PayloadRegistry> {
    let payloads = PayloadRegistry::new();

    // {"ms": 1000}; returns 1 if aborted
    payloads.register("sleep", |scope: TaskScope| async move {
        let ms = scope.params["ms"].as_u64().unwrap_or(1_000);
        tokio::select! {
            _ = scope.abort.aborted() => 1,
            _ = tokio::time::sleep(Duration::from_millis(ms)) => 0,
        }
    });

    // {"code": 3}
    payloads.register("echo", |scope: TaskScope| async move {
        scope.params["code"]
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(0)
    });

    // {"base": 100}; rank + base
    payloads.register("sum_rank", |scope: TaskScope| async move {
        let base = scope.params["base"].as_i64().unwrap_or(0);
        i32::try_from(base + scope.context.rank as i64).unwrap_or(i32::MAX)
    });

    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_timeout_flag_reaches_config() {
        let cli = Cli::try_parse_from([
            "compute-node",
            "--bind",
            "127.0.0.1:7000",
            "--role",
            "master",
            "--barrier-timeout-ms",
            "250",
        ])
        .unwrap();

        let config = cli.config();

        assert_eq!(config.role, ComputeRole::Master);
        assert_eq!(config.barrier_timeout(), Some(Duration::from_millis(250)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_barrier_timeout_defaults_to_unbounded() {
        let cli = Cli::try_parse_from(["compute-node", "--bind", "127.0.0.1:7000"]).unwrap();

        assert_eq!(cli.config().barrier_timeout(), None);
    }
}
