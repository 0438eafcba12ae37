pub mod connection;
pub mod echo;
pub mod frame_codec;
pub mod network_config;
pub mod persistent_client;
pub mod send_queue;
pub mod server;
