//! `DuoChat` client library: socket transport, message API client, chat
//! state, and the background session driver.

pub mod api;
pub mod config;
pub mod net;
pub mod state;
pub mod transport;
