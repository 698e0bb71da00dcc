//! RESP (Redis Serialization Protocol) implementation.
//!
//! RESP2 framing, request decoding and the per-connection loop.

pub mod command;
pub mod handler;
pub mod parser;

pub use command::Command;
pub use handler::handle_connection;
pub use parser::Frame;
