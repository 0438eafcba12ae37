use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bsonrouter::network::network_config::NetworkConfig;
use bsonrouter::router::router::Router;
use bsonrouter::router::router_config::{QueuePolicy, RouterConfig};
use bsonrouter::util::log_level::LogLevel;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

/// Routes documents between clients, queuing documents for clients that are offline.
#[derive(Parser)]
struct Args {
    /// port to listen on, 0 for an ephemeral port
    #[clap(short, long, default_value_t = 0)]
    port: u16,

    /// the router's own client id
    #[clap(short = 'i', long, default_value = "$router")]
    client_id: String,

    /// maximum number of registered clients
    #[clap(short = 'c', long = "clients", default_value_t = 100)]
    max_clients: usize,

    /// maximum number of documents queued for offline clients
    #[clap(short = 'q', long = "queue", default_value_t = 1000)]
    max_queued: usize,

    /// shared secret that every document must carry
    #[clap(short, long)]
    secret: Option<String>,

    #[clap(short, long, value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    logging: LogLevel,

    /// peers to connect to, e.g. another router
    #[clap(long)]
    connect_to: Vec<SocketAddr>,

    #[clap(long, value_enum, ignore_case = true, default_value_t = QueuePolicy::Always)]
    queue_policy: QueuePolicy,

    /// keepalive timeout for outgoing peer connections
    #[clap(long, default_value_t = 1000)]
    keepalive_ms: u64,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(args.logging))
        .try_init()
        .ok();

    let mut network_config = NetworkConfig::new(args.client_id);
    network_config.secret = args.secret;
    network_config.keepalive_timeout = Duration::from_millis(args.keepalive_ms);

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let mut config = RouterConfig::new(listen_addr, Arc::new(network_config));
    config.max_clients = args.max_clients;
    config.max_queued_documents = args.max_queued;
    config.queue_policy = args.queue_policy;
    config.connect_to = args.connect_to;

    let router = Router::new(Arc::new(config));
    let server = router.bind().await?;
    info!("router {} listening on {}", router.own_id(), server.local_addr()?);

    router.run(server).await
}
