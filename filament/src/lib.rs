//! `filament` is an embedded-class HTTP 1.1 server with WebSocket,
//! Server-Sent-Events and multipart upload support, designed around a small
//! fixed pool of connection slots over non-blocking BSD-style sockets.
//!
//! Two long-running threads cooperate: a listener thread that accepts TCP
//! connections and hands them off through a bounded queue, and a service
//! thread that drives every connection slot once per tick. Each slot glues a
//! socket, a streaming request parser, a transmit queue and a responder
//! together; responders produce the reply bytes for one request (static file,
//! in-memory data, REST API, WebSocket or SSE stream).

pub mod fs;
pub mod http;
pub mod net;
pub mod server;
pub mod settings;
pub mod ws;

pub use crate::net::defs::{RecvOutcome, SendOutcome};
pub use crate::server::server::FilamentServer;
pub use crate::settings::ServerSettings;

#[cfg(test)]
pub(crate) mod test_support;
