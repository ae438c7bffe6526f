//! WebSocket server and connection handling.
//!
//! The `/ws` handler owns the socket and its heartbeat; the [`server::WsServer`]
//! actor owns the per-connection queues and the topic hub they publish into.

pub mod handler;
pub mod server;

pub use proximity_ws::models::ConnId;

/// Message type for outbound WebSocket text frames.
pub type Msg = String;
