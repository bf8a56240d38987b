//! Shared protocol definitions for the `DuoChat` wire format.

pub mod api;
pub mod codec;
pub mod event;
pub mod message;
pub mod presence;
