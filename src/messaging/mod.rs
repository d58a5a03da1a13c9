pub mod inbox;
pub mod message;
pub mod message_dispatcher;
pub mod op_sink;
pub mod replay_buffer;
pub mod request_table;
pub mod requester;
pub mod subscription_registry;
