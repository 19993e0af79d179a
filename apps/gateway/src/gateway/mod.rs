//! Real-time delivery: WebSocket sessions, the connection registry and the
//! cross-process bus.

pub mod bus;
pub mod connection;
pub mod events;
pub mod handler;
pub mod listener;
pub mod publisher;
pub mod registry;
pub mod server;
