use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::document::document::Document;
use crate::network::connection::{Connection, ConnectionHandler};

struct EventChannel<T> {
    sender: UnboundedSender<T>,
    receiver: Mutex<UnboundedReceiver<T>>,
}

impl <T> EventChannel<T> {
    fn new() -> EventChannel<T> {
        let (sender, receiver) = unbounded_channel();
        EventChannel {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    fn record(&self, event: T) {
        let _ = self.sender.send(event);
    }

    async fn next(&self, kind: &str) -> T {
        let mut receiver = self.receiver.lock().await;
        match timeout(Duration::from_secs(5), receiver.recv()).await {
            Ok(Some(event)) => event,
            _ => panic!("no {} within 5 seconds", kind),
        }
    }

    fn is_empty(&self) -> bool {
        match self.receiver.try_lock() {
            Ok(receiver) => receiver.is_empty(),
            Err(_) => false,
        }
    }
}

/// A [ConnectionHandler] that records every callback, for tests to pick up in order.
pub struct RecordingHandler {
    identified: EventChannel<(String, Arc<Connection>)>,
    messages: EventChannel<Document>,
    forward_candidates: EventChannel<Document>,
    controls: EventChannel<Document>,
    closed: EventChannel<Arc<Connection>>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        RecordingHandler {
            identified: EventChannel::new(),
            messages: EventChannel::new(),
            forward_candidates: EventChannel::new(),
            controls: EventChannel::new(),
            closed: EventChannel::new(),
        }
    }

    pub async fn next_identification(&self) -> (String, Arc<Connection>) {
        self.identified.next("identification").await
    }

    pub async fn next_identified(&self) -> String {
        self.next_identification().await.0
    }

    pub async fn next_message(&self) -> Document {
        self.messages.next("message").await
    }

    pub async fn next_forward_candidate(&self) -> Document {
        self.forward_candidates.next("forward candidate").await
    }

    pub async fn next_control(&self) -> Document {
        self.controls.next("control document").await
    }

    pub async fn wait_closed(&self) -> Arc<Connection> {
        self.closed.next("close notification").await
    }

    /// true if every recorded event was picked up
    pub fn no_more_events(&self) -> bool {
        self.identified.is_empty()
            && self.messages.is_empty()
            && self.forward_candidates.is_empty()
            && self.controls.is_empty()
            && self.closed.is_empty()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        RecordingHandler::new()
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn on_identify(&self, connection: &Arc<Connection>, client_id: &str) {
        self.identified.record((client_id.to_string(), connection.clone()));
    }

    async fn on_control(&self, _connection: &Arc<Connection>, doc: Document) {
        self.controls.record(doc);
    }

    async fn on_message(&self, _connection: &Arc<Connection>, doc: Document) {
        self.messages.record(doc);
    }

    async fn on_forward_candidate(&self, _connection: &Arc<Connection>, doc: Document) {
        self.forward_candidates.record(doc);
    }

    async fn on_closed(&self, connection: &Arc<Connection>) {
        self.closed.record(connection.clone());
    }
}
