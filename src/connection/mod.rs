pub mod active_connection;
pub mod close_signal;
pub mod connection_config;
pub mod connection_events;
pub mod connection_manager;
pub mod connection_state;
pub mod engine;
pub mod server_pool;
pub mod writer;
