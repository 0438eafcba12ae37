pub mod offline_queue;
pub mod router;
pub mod router_config;
