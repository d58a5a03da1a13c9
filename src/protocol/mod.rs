//! The NATS wire codec: a textual, line-oriented protocol with CRLF-terminated control lines,
//!  some of which announce a binary payload of a given length.
//!
//! This module is stateless. [decoder::decode] pulls exactly one [operation::Operation] from a
//!  [crate::transport::transport::TransportReader], and [encoder::encode] appends one to a buffer.

pub mod decoder;
pub mod encoder;
pub mod headers;
pub mod operation;
pub mod protocol_error;
pub mod server_info;
