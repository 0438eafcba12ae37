use std::net::SocketAddr;
use std::sync::Arc;

use clap_derive::ValueEnum;

use crate::network::network_config::NetworkConfig;

/// What the router does with a document whose destination is not connected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, ValueEnum)]
pub enum QueuePolicy {
    /// queue every such document
    #[default]
    Always,
    /// queue only documents that ask for it with a truthy `_que` field, drop all others
    #[value(alias = "optin")]
    OptIn,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub network: Arc<NetworkConfig>,
    pub listen_addr: SocketAddr,

    /// registering a new client id is refused while more than this number of clients are
    ///  registered
    pub max_clients: usize,
    /// total number of documents queued for offline clients, across all clients
    pub max_queued_documents: usize,
    pub queue_policy: QueuePolicy,

    /// peers the router connects to itself (rather than waiting for them to connect), each
    ///  through a persistent client
    pub connect_to: Vec<SocketAddr>,
}

impl RouterConfig {
    pub fn new(listen_addr: SocketAddr, network: Arc<NetworkConfig>) -> RouterConfig {
        RouterConfig {
            network,
            listen_addr,
            max_clients: 100,
            max_queued_documents: 1000,
            queue_policy: Default::default(),
            connect_to: Vec::new(),
        }
    }
}
