use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::document::document::{Document, QUEUE_KEY};
use crate::network::connection::{Connection, ConnectionHandler};
use crate::network::persistent_client::PersistentClient;
use crate::network::server::Server;
use crate::router::offline_queue::OfflineQueue;
use crate::router::router_config::{QueuePolicy, RouterConfig};

struct RouterState {
    clients: FxHashMap<String, Arc<Connection>>,
    queue: OfflineQueue,
}

/// Delivers documents between connected clients, and queues documents for clients that are not
///  connected until they (re)connect.
///
/// The registry of connected clients and the offline queue are protected by a single lock, and
///  every operation (registering plus flushing the queue, forwarding plus queuing) happens in a
///  single critical section. Sending to a connection only enqueues to its send queue and never
///  waits for the peer, so holding the lock while sending does not stall the router.
pub struct Router {
    config: Arc<RouterConfig>,
    state: Mutex<RouterState>,
    span: Span,
}

impl Router {
    pub fn new(config: Arc<RouterConfig>) -> Arc<Router> {
        let queue = OfflineQueue::new(config.max_queued_documents);
        let span = info_span!("router", id = %config.network.client_id);
        Arc::new(Router {
            config,
            state: Mutex::new(RouterState {
                clients: Default::default(),
                queue,
            }),
            span,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// the router's own client id
    pub fn own_id(&self) -> &str {
        &self.config.network.client_id
    }

    /// the handler for connections on behalf of this router
    pub fn handler(self: &Arc<Self>) -> Arc<RouterHandler> {
        Arc::new(RouterHandler {
            router: self.clone(),
        })
    }

    pub async fn num_clients(&self) -> usize {
        self.state.lock().await
            .clients
            .len()
    }

    /// total number of documents waiting for offline clients
    pub async fn num_queued(&self) -> usize {
        self.state.lock().await
            .queue
            .len()
    }

    pub async fn num_queued_for(&self, client_id: &str) -> usize {
        self.state.lock().await
            .queue
            .len_for(client_id)
    }

    pub async fn is_registered(&self, client_id: &str) -> bool {
        self.state.lock().await
            .clients
            .contains_key(client_id)
    }

    /// Registers a connection as the live session for a client id, replacing a previous session
    ///  for that id, and sends it all documents that were queued for the id.
    ///
    /// If the id is not registered yet and the number of registered clients already exceeds the
    ///  configured maximum, the connection is closed instead, and this function returns `false`.
    pub async fn register_client(&self, client_id: &str, connection: &Arc<Connection>) -> bool {
        let mut state = self.state.lock().await;

        // a connection that identifies itself under a new id gives up its old id
        state.clients.retain(|id, registered| id == client_id || !Arc::ptr_eq(registered, connection));

        let is_new = !state.clients.contains_key(client_id);
        if is_new && state.clients.len() > self.config.max_clients {
            warn!("refused connection to {}: {} clients are registered already", client_id, state.clients.len());
            drop(state);
            connection.close().await;
            return false;
        }

        if let Some(previous) = state.clients.insert(client_id.to_string(), connection.clone()) {
            if !Arc::ptr_eq(&previous, connection) {
                debug!("replacing previous connection for {} from {}", client_id, previous.peer_addr());
            }
        }
        info!("client connected: {} ({})", client_id, state.clients.len());

        let queued = state.queue.drain(client_id);
        if !queued.is_empty() {
            debug!("sending {} queued document(s) to {}", queued.len(), client_id);
        }
        for doc in queued {
            let src = doc_src(&doc).to_string();
            if connection.send_raw(doc).await.is_err() {
                info!("dropped document from {} to {}", src, client_id);
            }
        }
        true
    }

    /// Unregisters a client id regardless of the connection registered for it. Returns `true` if
    ///  the id was registered.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        self.state.lock().await
            .clients
            .remove(client_id)
            .is_some()
    }

    /// Unregisters a client id, but only if it is registered for the given connection. A client
    ///  that reconnected may be registered with its new connection by the time its old
    ///  connection is cleaned up.
    pub async fn remove_connection(&self, client_id: &str, connection: &Arc<Connection>) -> bool {
        let mut state = self.state.lock().await;
        match state.clients.get(client_id) {
            Some(registered) if Arc::ptr_eq(registered, connection) => {
                state.clients.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Passes a document on to its destination if that is connected, or handles it according
    ///  to the queue policy if not.
    pub async fn forward(&self, doc: Document) {
        let dst = match doc.dst() {
            Some(dst) => dst.to_string(),
            None => {
                warn!("document without destination can not be forwarded");
                return;
            }
        };
        let src = doc_src(&doc).to_string();
        info!("forwarding document from {} to {}", src, dst);

        let mut state = self.state.lock().await;
        let live = state.clients.get(&dst)
            .filter(|c| !c.is_closed())
            .cloned();

        match live {
            Some(connection) => {
                if connection.send_raw(doc).await.is_err() {
                    info!("dropped document from {} to {}", src, dst);
                }
            }
            None => self.queue_offline(&mut state, &src, &dst, doc),
        }
    }

    fn queue_offline(&self, state: &mut RouterState, src: &str, dst: &str, doc: Document) {
        if self.config.queue_policy == QueuePolicy::OptIn {
            let opted_in = doc.get(QUEUE_KEY)
                .map(|v| v.is_truthy())
                .unwrap_or(false);
            if !opted_in {
                info!("dropped document from {} to {}", src, dst);
                return;
            }
        }

        info!("queued document from {} to {}", src, dst);
        for evicted in state.queue.enqueue(dst, doc) {
            info!("dropped document from {} to {}", doc_src(&evicted), evicted.dst().unwrap_or_default());
        }
    }

    /// Runs the router: connects to the configured peers and accepts connections on the server.
    pub async fn run(self: Arc<Self>, server: Server<RouterHandler>) -> anyhow::Result<()> {
        let span = self.span.clone();

        async move {
            let mut peers = Vec::new();
            for addr in &self.config.connect_to {
                info!("connecting to peer {}", addr);
                let peer = Arc::new(PersistentClient::new(*addr, self.config.network.clone(), self.handler()));
                peers.push(peer.clone());
                tokio::spawn(async move { peer.run().await }.in_current_span());
            }

            let result = server.accept_loop().await;

            for peer in peers {
                peer.disconnect().await;
            }
            result
        }
            .instrument(span)
            .await
    }

    /// binds a server for this router to the configured listen address
    pub async fn bind(self: &Arc<Self>) -> anyhow::Result<Server<RouterHandler>> {
        Server::bind(self.config.listen_addr, self.config.network.clone(), self.handler()).await
    }
}

fn doc_src(doc: &Document) -> &str {
    doc.src().unwrap_or_default()
}


/// The router's side of a client connection.
pub struct RouterHandler {
    router: Arc<Router>,
}

impl RouterHandler {
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

#[async_trait]
impl ConnectionHandler for RouterHandler {
    async fn on_identify(&self, connection: &Arc<Connection>, client_id: &str) {
        self.router.register_client(client_id, connection).await;
    }

    async fn on_message(&self, _connection: &Arc<Connection>, doc: Document) {
        error!("router received a document addressed to itself: {:?}", doc);
    }

    async fn on_forward_candidate(&self, _connection: &Arc<Connection>, doc: Document) {
        self.router.forward(doc).await;
    }

    async fn on_closed(&self, connection: &Arc<Connection>) {
        if let Some(client_id) = connection.client_id().await {
            if self.router.remove_connection(&client_id, connection).await {
                info!("client disconnected: {}", client_id);
            }
        }
    }
}
