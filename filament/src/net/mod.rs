//! Socket-facing layer: outcome types, the bounded transmit buffer, the
//! client connection abstraction and the listener task.

pub mod buffer;
pub mod client;
pub mod defs;
pub mod listener;
