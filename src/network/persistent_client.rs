use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::document::document::{Document, CTL_ECHO, CTL_KEY};
use crate::network::connection::{run_connection, Connection, ConnectionHandler};
use crate::network::network_config::NetworkConfig;

/// A client connection to a fixed address that is re-established whenever it is lost, until
///  [PersistentClient::disconnect] is called.
///
/// While connected, it sends a keepalive document whenever nothing was received for the configured
///  keepalive timeout. It does not act on missing replies: a dead peer is detected by the
///  transport, and handlers can inspect [Connection::last_receive_time] for stricter policies.
pub struct PersistentClient<H: ConnectionHandler> {
    addr: SocketAddr,
    config: Arc<NetworkConfig>,
    handler: Arc<H>,
    persist: AtomicBool,
    stop: Notify,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl <H: ConnectionHandler> PersistentClient<H> {
    pub fn new(addr: SocketAddr, config: Arc<NetworkConfig>, handler: Arc<H>) -> PersistentClient<H> {
        PersistentClient {
            addr,
            config,
            handler,
            persist: AtomicBool::new(true),
            stop: Notify::new(),
            connection: Default::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// the current connection, if there is one
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().await
            .clone()
    }

    fn is_persistent(&self) -> bool {
        self.persist.load(Ordering::Acquire)
    }

    /// Connects and keeps reconnecting until [PersistentClient::disconnect] is called.
    #[instrument(name="persistent_client", skip(self), fields(addr = %self.addr))]
    pub async fn run(&self) {
        while self.is_persistent() {
            if let Err(e) = self.connect_and_run().await {
                warn!("connection to {} failed: {}", self.addr, e);
            }

            let stopped = self.stop.notified();
            if !self.is_persistent() {
                break;
            }

            debug!("reconnecting in {:?}", self.config.reconnect_interval);
            select! {
                _ = stopped => break,
                _ = sleep(self.config.reconnect_interval) => {}
            }
        }
        info!("persistent client stopped");
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        info!("connected to {}", peer_addr);

        let (reader, writer) = stream.into_split();
        let connection = Connection::new(self.config.clone(), peer_addr, writer);
        *self.connection.write().await = Some(connection.clone());

        if !self.is_persistent() {
            // disconnect() was called while we were connecting
            connection.close().await;
        }

        let keepalive = keepalive_loop(connection.clone(), self.config.keepalive_timeout)
            .instrument(connection.span().clone());

        let result = select! {
            result = run_connection(connection.clone(), reader, self.handler.clone()) => result,
            _ = keepalive => Ok(()),
        };

        *self.connection.write().await = None;
        result
    }

    /// Stops reconnecting and closes the current connection, if any.
    pub async fn disconnect(&self) {
        self.persist.store(false, Ordering::Release);
        self.stop.notify_waiters();

        if let Some(connection) = self.connection().await {
            connection.close().await;
        }
    }
}

/// Periodically checks whether anything was received on the connection within
///  `keepalive_timeout`, sending a keepalive document `{_ctl: "echo"}` if not.
///
/// Nothing is sent before the first document was received, i.e. while the peer has not even
///  identified itself. The loop never terminates on its own, it is meant to be dropped together
///  with the connection's reader.
pub async fn keepalive_loop(connection: Arc<Connection>, keepalive_timeout: Duration) {
    let check_interval = (keepalive_timeout / 5).max(Duration::from_millis(1));

    loop {
        sleep(check_interval).await;

        if connection.is_closed() || connection.num_received().await == 0 {
            continue;
        }

        let silence = connection.last_receive_time().await.elapsed();
        if silence > keepalive_timeout {
            info!("nothing received for {:?} - sending keepalive", silence);
            let mut keepalive = Document::new();
            keepalive.insert(CTL_KEY, CTL_ECHO);
            let _ = connection.send_message(keepalive).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::document::{DST_KEY, SRC_KEY};
    use crate::network::frame_codec::FrameCodec;
    use crate::network::server::Server;
    use crate::test_util::{test_addr, DocumentReader, RecordingHandler};
    use tokio::io::AsyncWriteExt;
    use tokio::time::{timeout, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_keepalive() {
        let (our_write, peer_read) = tokio::io::duplex(64 * 1024);
        let (mut peer_write, our_read) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(Arc::new(NetworkConfig::new("client")), test_addr(1), our_write);
        tokio::spawn(run_connection(connection.clone(), our_read, Arc::new(RecordingHandler::new())));
        tokio::spawn(keepalive_loop(connection.clone(), Duration::from_secs(1)));

        let mut peer_reader = DocumentReader::new(peer_read);
        assert_eq!(peer_reader.next().await.unwrap(), doc!{SRC_KEY => "client"});

        // nothing was received yet, so there are no keepalives
        assert!(peer_reader.next_timeout(Duration::from_secs(3)).await.is_none());

        peer_write.write_all(&FrameCodec::encode(&doc!{SRC_KEY => "router"}, 1024).unwrap()).await.unwrap();
        let received_at = Instant::now();

        let keepalive = peer_reader.next_timeout(Duration::from_secs(5)).await.unwrap();
        let delay = received_at.elapsed();
        assert_eq!(keepalive, doc!{CTL_KEY => CTL_ECHO, SRC_KEY => "client", DST_KEY => "router"});
        assert!(delay > Duration::from_secs(1), "{:?}", delay);
        assert!(delay <= Duration::from_millis(1400), "{:?}", delay);

        // without a reply, keepalives continue at most once per check interval
        let sent_at = Instant::now();
        assert!(peer_reader.next_timeout(Duration::from_secs(1)).await.is_some());
        assert!(sent_at.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_not_sent_while_data_arrives() {
        let (our_write, peer_read) = tokio::io::duplex(64 * 1024);
        let (mut peer_write, our_read) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(Arc::new(NetworkConfig::new("client")), test_addr(1), our_write);
        tokio::spawn(run_connection(connection.clone(), our_read, Arc::new(RecordingHandler::new())));
        tokio::spawn(keepalive_loop(connection.clone(), Duration::from_secs(1)));

        let mut peer_reader = DocumentReader::new(peer_read);
        peer_reader.next().await.unwrap();

        for i in 0..10 {
            let doc = doc!{SRC_KEY => "router", DST_KEY => "client", "i" => i};
            peer_write.write_all(&FrameCodec::encode(&doc, 1024).unwrap()).await.unwrap();
            assert!(peer_reader.next_timeout(Duration::from_millis(700)).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_keepalive_while_running() {
        let server_handler = Arc::new(RecordingHandler::new());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkConfig::new("server")), server_handler.clone()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.accept_loop().await });

        let mut config = NetworkConfig::new("client");
        config.keepalive_timeout = Duration::from_millis(100);
        let client = Arc::new(PersistentClient::new(server_addr, Arc::new(config), Arc::new(RecordingHandler::new())));
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        let (id, _) = server_handler.next_identification().await;
        assert_eq!(id, "client");

        // the server sends nothing except its identification and the replies
        for _ in 0..3 {
            assert_eq!(server_handler.next_control().await, doc!{CTL_KEY => CTL_ECHO, SRC_KEY => "client", DST_KEY => "server"});
        }

        client.disconnect().await;
        timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap();
        server_handler.wait_closed().await;

        // whatever was on the wire before the close, and nothing after it
        while timeout(Duration::from_millis(50), server_handler.next_control()).await.is_ok() {}
        sleep(Duration::from_millis(300)).await;
        assert!(server_handler.no_more_events());
        assert!(client.connection().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect() {
        let server_handler = Arc::new(RecordingHandler::new());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkConfig::new("server")), server_handler.clone()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.accept_loop().await });

        let mut config = NetworkConfig::new("client");
        config.reconnect_interval = Duration::from_millis(50);
        let client_handler = Arc::new(RecordingHandler::new());
        let client = Arc::new(PersistentClient::new(server_addr, Arc::new(config), client_handler.clone()));
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        let (id, server_side) = server_handler.next_identification().await;
        assert_eq!(id, "client");
        assert_eq!(client_handler.next_identified().await, "server");

        // the server drops the connection, the client comes back
        server_side.close().await;
        client_handler.wait_closed().await;
        let (id, _) = server_handler.next_identification().await;
        assert_eq!(id, "client");
        assert_eq!(client_handler.next_identified().await, "server");
        assert!(client.connection().await.is_some());

        client.disconnect().await;
        timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap();
        assert!(client.connection().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_during_backoff() {
        // grab a free port, and make sure nobody listens on it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = NetworkConfig::new("client");
        config.reconnect_interval = Duration::from_secs(3600);
        let client = Arc::new(PersistentClient::new(addr, Arc::new(config), Arc::new(RecordingHandler::new())));
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        sleep(Duration::from_millis(50)).await;
        client.disconnect().await;
        timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap();
    }
}
