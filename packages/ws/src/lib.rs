//! Presence and media signaling over the proximity websocket.
//!
//! A socket is registered in a room when it opens, becomes visible to the
//! room with `connect`, and from then on streams position and presentation
//! changes to everybody subscribed to the room's topics. Media negotiation
//! requests are forwarded to a [`proximity_session::SessionCoordinator`] and
//! answered with an ACK carrying the request id.
//!
//! # Features
//!
//! * `ws` - Connection handling; without it only the wire [`models`] are built
//!
//! # Main Components
//!
//! * [`topics::WebsocketSender`] - Transport seam for direct sends and room topics
//! * [`ProximityState`] - Everything shared between connections
//! * [`queue::ConnectionQueue`] - Serial per-connection processing
//! * [`process_message`] - Parses and handles one inbound frame
//! * [`connect`] and [`disconnect`] - Connection lifecycle

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(feature = "ws")]
mod ws;

#[cfg(feature = "ws")]
pub use ws::*;

#[cfg(feature = "ws")]
pub mod broadcaster;
#[cfg(feature = "ws")]
pub mod queue;
#[cfg(feature = "ws")]
pub mod registry;
#[cfg(feature = "ws")]
pub mod topics;

pub mod models;
