//! Utilities for testing code that talks to a server through this client: an in-memory
//!  connector with step-by-step control of the server side, a small in-process server that
//!  routes messages between its clients, and a recording [crate::messaging::op_sink::OpSink].
//!
//! They are used by the crate's own tests, but they are exported for application testing as
//!  well, so they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod test_server;
pub mod tracking_sink;
