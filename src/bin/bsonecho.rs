use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bsonrouter::network::echo::EchoHandler;
use bsonrouter::network::network_config::NetworkConfig;
use bsonrouter::network::server::Server;
use bsonrouter::util::log_level::LogLevel;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

/// Sends every document it receives back to its sender.
#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = 0)]
    port: u16,

    #[clap(short = 'i', long, default_value = "echoer")]
    client_id: String,

    #[clap(short, long)]
    secret: Option<String>,

    #[clap(short, long, value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    logging: LogLevel,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(args.logging))
        .try_init()
        .ok();

    let mut config = NetworkConfig::new(args.client_id);
    config.secret = args.secret;

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let server = Server::bind(listen_addr, Arc::new(config), Arc::new(EchoHandler)).await?;
    info!("echo server listening on {}", server.local_addr()?);

    server.accept_loop().await
}
