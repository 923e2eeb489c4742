//! Request handlers for sync operations.

mod sync;
mod websocket;

pub use sync::*;
pub use websocket::*;
