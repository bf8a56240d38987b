//! `DuoChat` relay server library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The server tracks which user is online on which WebSocket, pushes live
//! message and read-receipt events to them, and serves the message API
//! that persists conversations.

pub mod api;
pub mod config;
pub mod presence;
pub mod relay;
pub mod store;
pub mod users;
