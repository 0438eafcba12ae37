use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, field, info, info_span, trace, warn, Instrument, Span};

use crate::document::document::{Document, CTL_ECHO, CTL_ECHO_REPLY, CTL_KEEPALIVE, CTL_KEY, DST_KEY, ECHO_ADDRESS_KEY, SEC_KEY, SRC_KEY};
use crate::network::frame_codec::FrameCodec;
use crate::network::network_config::NetworkConfig;
use crate::network::send_queue::SendQueue;
use crate::util::error::SendError;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// the peer has not identified itself yet
    Unidentified,
    Identified,
    /// terminal
    Closed,
}

/// The role-specific part of a connection's behavior. A connection handles framing, validation,
///  identification and the built-in control messages itself, and delegates everything else to
///  its handler.
///
/// All callbacks are invoked from the connection's reader task, one document at a time.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// called for every identification document, i.e. every valid document without `_dst`
    async fn on_identify(&self, _connection: &Arc<Connection>, _client_id: &str) {
    }

    /// called for control documents addressed to this process, after the built-in control
    ///  handling
    async fn on_control(&self, _connection: &Arc<Connection>, _doc: Document) {
    }

    /// called for regular documents addressed to this process
    async fn on_message(&self, connection: &Arc<Connection>, doc: Document);

    /// Called for documents addressed to some other client. Connections that don't route
    ///  documents drop them.
    async fn on_forward_candidate(&self, _connection: &Arc<Connection>, doc: Document) {
        debug!("dropping document addressed to {:?}", doc.dst());
    }

    /// called exactly once after the connection was closed
    async fn on_closed(&self, _connection: &Arc<Connection>) {
    }
}

struct ConnectionData {
    state: ConnectionState,
    client_id: Option<String>,
    last_send_time: Instant,
    last_receive_time: Instant,
    num_received: u64,
}

/// A live session with a peer - either accepted by a server or established by a client.
///
/// This is the protocol's state machine. On creation it sends the identification document
///  `{_src: <own id>}`, and every valid document the peer sends is classified as either
///  * an identification document (no `_dst`): its `_src` becomes the peer's client id
///  * a control document for this process (`_dst` is our own id, and `_ctl` is present)
///  * a document for somebody else (`_dst` is not our own id), which is handed to the
///    handler for forwarding
///  * a regular document for this process
pub struct Connection {
    own_id: String,
    peer_addr: SocketAddr,
    config: Arc<NetworkConfig>,
    send_queue: SendQueue,
    data: RwLock<ConnectionData>,
    closed: AtomicBool,
    close_notify: Notify,
    span: Span,
}

impl Connection {
    /// Creates the connection and sends the identification document. Incoming data is not
    ///  processed until the connection is passed to [run_connection].
    pub fn new<W>(config: Arc<NetworkConfig>, peer_addr: SocketAddr, writer: W) -> Arc<Connection>
    where W: AsyncWrite + Send + Unpin + 'static
    {
        let span = info_span!("connection", peer = %peer_addr, client_id = field::Empty);
        let send_queue = SendQueue::new(writer, config.send_queue_capacity, span.clone());
        let now = Instant::now();

        let connection = Arc::new(Connection {
            own_id: config.client_id.clone(),
            peer_addr,
            config,
            send_queue,
            data: RwLock::new(ConnectionData {
                state: ConnectionState::Unidentified,
                client_id: None,
                last_send_time: now,
                last_receive_time: now,
                num_received: 0,
            }),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            span,
        });

        let mut identification = Document::new();
        identification.insert(SRC_KEY, connection.own_id.as_str());

        connection.span.in_scope(|| {
            debug!("sending identification document");
            if let Err(e) = connection.encode_and_enqueue(identification) {
                warn!("sending identification document failed: {}", e);
            }
        });

        connection
    }

    /// this process' client id
    pub fn own_id(&self) -> &str {
        &self.own_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// the client id the peer claimed for itself, if it identified itself already
    pub async fn client_id(&self) -> Option<String> {
        self.data.read().await
            .client_id
            .clone()
    }

    pub async fn state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        self.data.read().await.state
    }

    pub async fn last_send_time(&self) -> Instant {
        self.data.read().await.last_send_time
    }

    pub async fn last_receive_time(&self) -> Instant {
        self.data.read().await.last_receive_time
    }

    /// number of valid documents received on this connection
    pub async fn num_received(&self) -> u64 {
        self.data.read().await.num_received
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection: the writer task stops (discarding unsent documents) and the
    ///  reader task terminates. Closing an already closed connection has no effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.data.write().await.state = ConnectionState::Closed;
        self.send_queue.close();
        self.close_notify.notify_waiters();
    }

    /// Sends a document to the peer, adding `_src` (our own id) and `_dst` (the peer's id) if
    ///  they are missing.
    pub async fn send_message(&self, doc: Document) -> Result<(), SendError> {
        self.send_message_with(doc, None, None).await
    }

    /// Sends a document to the peer. `_src` and `_dst` are set to the given values if those
    ///  are present, and to the defaults (our own id / the peer's id) if the document does not
    ///  contain them.
    pub async fn send_message_with(&self, mut doc: Document, src: Option<&str>, dst: Option<&str>) -> Result<(), SendError> {
        if src.is_some() || !doc.contains_key(SRC_KEY) {
            doc.insert(SRC_KEY, src.unwrap_or(&self.own_id));
        }

        if dst.is_some() || !doc.contains_key(DST_KEY) {
            let dst = match dst {
                Some(dst) => Some(dst.to_string()),
                None => self.client_id().await,
            };
            // if the peer did not identify itself yet, there is no sensible default
            if let Some(dst) = dst {
                doc.insert(DST_KEY, dst);
            }
        }

        self.send_raw(doc).await
    }

    /// Sends a document as it is, without touching its routing fields. This is what the router
    ///  uses to pass documents on.
    pub async fn send_raw(&self, doc: Document) -> Result<(), SendError> {
        trace!("sending document {:?}", doc);

        match self.encode_and_enqueue(doc) {
            Ok(()) => {
                self.data.write().await.last_send_time = Instant::now();
                Ok(())
            }
            Err(e) => {
                warn!("sending document failed: {}", e);
                Err(e)
            }
        }
    }

    fn encode_and_enqueue(&self, mut doc: Document) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        if let Some(secret) = &self.config.secret {
            if !doc.contains_key(SEC_KEY) {
                doc.insert(SEC_KEY, secret.as_str());
            }
        }

        let frame = FrameCodec::encode(&doc, self.config.max_document_len)?;
        self.send_queue.enqueue(frame)
    }

    fn validate(&self, doc: &Document) -> Result<(), String> {
        if !doc.contains_key(SRC_KEY) {
            return Err("no source id".to_string());
        }
        if doc.src().is_none() {
            return Err("source id is not a string".to_string());
        }
        if doc.contains_key(DST_KEY) && doc.dst().is_none() {
            return Err("destination id is not a string".to_string());
        }

        // NB: we do not check that `_src` matches the id the peer claimed initially

        if let Some(secret) = &self.config.secret {
            match doc.get_str(SEC_KEY) {
                None => return Err("no secret".to_string()),
                Some(s) if s != secret => return Err(format!("secret mismatch ({})", s)),
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Processes a single received document, see [Connection] for the classification.
    pub(crate) async fn on_document<H: ConnectionHandler + ?Sized>(self: &Arc<Self>, doc: Document, handler: &H) {
        debug!("document received");

        if let Err(reason) = self.validate(&doc) {
            warn!("document discarded: {}", reason);
            return;
        }
        trace!("document parsed: {:?}", doc);

        {
            let mut data = self.data.write().await;
            data.last_receive_time = Instant::now();
            data.num_received += 1;
        }

        match doc.dst() {
            None => {
                debug!("handling identification document");
                // validated above
                let client_id = doc.src().unwrap_or_default().to_string();
                self.identify(&client_id).await;
                handler.on_identify(self, &client_id).await;
                self.handle_control(&doc).await;
            }
            Some(dst) if dst == self.own_id && doc.contains_key(CTL_KEY) => {
                debug!("handling control document");
                self.handle_control(&doc).await;
                handler.on_control(self, doc).await;
            }
            Some(dst) if dst != self.own_id => {
                handler.on_forward_candidate(self, doc).await;
            }
            Some(_) => {
                handler.on_message(self, doc).await;
            }
        }
    }

    async fn identify(&self, client_id: &str) {
        let mut data = self.data.write().await;
        if data.client_id.as_deref() != Some(client_id) {
            if let Some(prev) = &data.client_id {
                info!("peer changed its client id from {} to {}", prev, client_id);
            }
            self.span.record("client_id", client_id);
            data.client_id = Some(client_id.to_string());
        }
        if data.state == ConnectionState::Unidentified {
            debug!("connection identified as {}", client_id);
            data.state = ConnectionState::Identified;
        }
    }

    /// the built-in control handling: address echo and keepalive acknowledgement
    async fn handle_control(&self, doc: &Document) {
        let mut response = Document::new();

        if doc.contains_key(ECHO_ADDRESS_KEY) {
            response.insert(ECHO_ADDRESS_KEY, self.peer_addr.to_string());
        }

        if matches!(doc.ctl(), Some(CTL_ECHO) | Some(CTL_KEEPALIVE)) {
            response.insert(CTL_KEY, CTL_ECHO_REPLY);
        }

        if response.is_empty() {
            return;
        }

        let dst = doc.src().map(str::to_string);
        // errors are logged by the send path
        let _ = self.send_message_with(response, None, dst.as_deref()).await;
    }
}


/// The reader task of a connection: reads from the transport, splits the data into documents
///  and processes them one at a time.
///
/// It returns when the peer closes the transport, when reading fails, when the peer violates the
///  framing protocol, or when the connection is closed locally. In all of these cases the
///  connection is closed and the handler is notified.
pub async fn run_connection<R, H>(connection: Arc<Connection>, mut reader: R, handler: Arc<H>) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin,
    H: ConnectionHandler + ?Sized,
{
    let span = connection.span.clone();
    async move {
        let result = receive_loop(&connection, &mut reader, handler.as_ref()).await;
        if let Err(e) = &result {
            warn!("connection failed: {}", e);
        }

        connection.close().await;
        handler.on_closed(&connection).await;
        info!("connection closed");
        result
    }
        .instrument(span)
        .await
}

async fn receive_loop<R, H>(connection: &Arc<Connection>, reader: &mut R, handler: &H) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin,
    H: ConnectionHandler + ?Sized,
{
    let mut codec = FrameCodec::new(connection.config.max_document_len);
    let mut chunk = vec![0u8; connection.config.read_buffer_size.max(1)];

    loop {
        let closed = connection.close_notify.notified();
        if connection.is_closed() {
            return Ok(());
        }

        let num_read = select! {
            _ = closed => return Ok(()),
            r = reader.read(&mut chunk) => r?,
        };
        if num_read == 0 {
            debug!("transport closed by peer");
            return Ok(());
        }
        codec.feed(&chunk[..num_read]);

        loop {
            match codec.next() {
                Ok(Some(doc)) => connection.on_document(doc, handler).await,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    error!("framing violation, closing connection: {}", e);
                    return Err(e.into());
                }
                Err(e) => warn!("{}", e),
            }

            if connection.is_closed() {
                return Ok(());
            }
        }
    }
}
