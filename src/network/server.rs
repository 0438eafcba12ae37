use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::network::connection::{run_connection, Connection, ConnectionHandler};
use crate::network::network_config::NetworkConfig;

/// Accepts TCP connections, running each of them in a task of its own with a shared handler.
pub struct Server<H: ConnectionHandler> {
    listener: TcpListener,
    config: Arc<NetworkConfig>,
    handler: Arc<H>,
}

impl <H: ConnectionHandler> Server<H> {
    pub async fn bind(addr: SocketAddr, config: Arc<NetworkConfig>, handler: Arc<H>) -> anyhow::Result<Server<H>> {
        Ok(Server {
            listener: TcpListener::bind(addr).await?,
            config,
            handler,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept_loop(&self) -> anyhow::Result<()> {
        info!("accepting connections on {}", self.local_addr()?);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // e.g. running out of file descriptors - this affects only the new connection
                    warn!("error accepting connection: {}", e);
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let config = self.config.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, config, handler).await {
                    debug!("connection from {} terminated with an error: {}", addr, e);
                }
            });
        }
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = %peer_addr))]
async fn handle_connection<H: ConnectionHandler>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<NetworkConfig>,
    handler: Arc<H>,
) -> anyhow::Result<()> {
    info!("connection accepted");
    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    let connection = Connection::new(config, peer_addr, writer);
    run_connection(connection, reader, handler).await
}
