//! WebSocket support for live sync.
//!
//! Clients bind to a branch, receive its snapshot, publish mutations with a
//! transaction id and subscribe to topics for delta envelopes.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
