use std::time::Duration;

use crate::network::frame_codec::DEFAULT_MAX_DOCUMENT_LEN;

/// Configuration shared by all connections of a process, regardless of their role.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// this process' client id, sent in the identification document and used as the default
    ///  `_src` for outgoing documents
    pub client_id: String,
    /// if set, every received document must carry it as `_sec`, and it is added to every
    ///  document sent
    pub secret: Option<String>,

    pub max_document_len: usize,
    pub send_queue_capacity: usize,
    pub read_buffer_size: usize,

    /// persistent clients send a keepalive document after this long without receiving anything
    pub keepalive_timeout: Duration,
    /// delay before a persistent client reconnects after losing its connection
    pub reconnect_interval: Duration,
}

impl NetworkConfig {
    pub fn new(client_id: impl Into<String>) -> NetworkConfig {
        NetworkConfig {
            client_id: client_id.into(),
            secret: None,
            max_document_len: DEFAULT_MAX_DOCUMENT_LEN,
            send_queue_capacity: 1000,
            read_buffer_size: 4096,
            keepalive_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}
