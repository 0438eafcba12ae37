use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::document::document::{Document, DST_KEY, SRC_KEY};
use crate::network::connection::{Connection, ConnectionHandler};

/// Sends every document addressed to this process back to its sender.
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_message(&self, connection: &Arc<Connection>, doc: Document) {
        let reply = flip_message(doc, connection.own_id());
        info!("echoing document to {:?}", reply.dst());
        let _ = connection.send_message(reply).await;
    }
}

/// turns a received document into its reply: `_dst` becomes the original sender
pub fn flip_message(mut doc: Document, own_id: &str) -> Document {
    let src = doc.src().map(str::to_string);
    doc.insert(SRC_KEY, own_id);
    match src {
        Some(src) => { doc.insert(DST_KEY, src); }
        None => { doc.remove(DST_KEY); }
    }
    doc
}
