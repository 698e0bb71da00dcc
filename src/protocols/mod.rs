//! Wire protocols.
//!
//! - `resp`: Redis RESP2, the only protocol clients speak to this server

pub mod resp;
