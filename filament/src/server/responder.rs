pub use crate::net::defs::ConnTx;
use std::time::Instant;

/// Produces the response bytes for a single request and consumes any inbound
/// bytes that arrive while it is attached (REST bodies, WebSocket frames).
///
/// A responder is owned by exactly one connection slot and never outlives it;
/// it is dropped when the slot clears.
pub trait Responder: Send {
    /// Called once when the responder is attached to the connection.
    fn start(&mut self, now: Instant) -> bool;

    /// Called every service tick.
    fn service(&mut self, _now: Instant, _tx: &mut dyn ConnTx) {}

    /// Inbound body/frame bytes from the connection.
    fn handle_inbound(&mut self, _data: &[u8], _now: Instant, _tx: &mut dyn ConnTx) -> bool {
        true
    }

    /// Whether `response_next` currently has something to produce.
    fn response_available(&self) -> bool {
        self.is_active()
    }

    /// Next chunk of response data, at most `max_len` bytes. Empty means
    /// nothing available right now.
    fn response_next(&mut self, max_len: usize, now: Instant) -> Vec<u8>;

    fn is_active(&self) -> bool;

    /// Flow-control hint: false pauses reads from the socket.
    fn ready_to_receive(&self) -> bool {
        true
    }

    /// Whether the channel behind this responder can take outbound data.
    fn ready_to_send(&mut self, _tx: &mut dyn ConnTx) -> bool {
        true
    }

    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    /// Body length when known up front.
    fn content_length(&self) -> Option<usize> {
        None
    }

    /// Extra headers appended to the standard header block.
    fn extra_headers(&self) -> &[(String, String)] {
        &[]
    }

    /// Long-running responders keep the connection open and disable the
    /// slot's timeouts.
    fn leave_conn_open(&self) -> bool {
        false
    }

    /// False when the responder emits its own header block (WebSocket
    /// upgrade, SSE preamble).
    fn std_header_required(&self) -> bool {
        true
    }

    /// Routing tag for externally addressed traffic (WebSocket channels).
    fn channel_id(&self) -> Option<u32> {
        None
    }

    /// Queue application data for an externally addressed channel.
    fn encode_and_send(&mut self, _data: &[u8], _now: Instant, _tx: &mut dyn ConnTx) -> bool {
        false
    }

    /// Queue a server-sent event (SSE responders only).
    fn send_event(&mut self, _content: &str, _group: &str) {}

    fn responder_type(&self) -> &'static str;
}
