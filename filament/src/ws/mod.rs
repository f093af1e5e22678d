//! RFC 6455 WebSocket support: wire-level frame codec and the protocol link
//! (handshake, ping/pong liveness, fragmentation reassembly).

pub mod frame;
pub mod link;
