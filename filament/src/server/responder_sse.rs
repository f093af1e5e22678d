use crate::server::responder::{ConnTx, Responder};
use lumen::logging::{self, warn, Logger};
use lumen::queue::BoundedQueue;
use lumen::time::timestamp_secs;
use std::time::Instant;

const EVENT_TX_QUEUE_SIZE: usize = 2;
const MAX_SSEVENT_SEND_RETRY_MS: u64 = 1;

/// Fixed response emitted before the event stream starts.
const SSE_PREAMBLE: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Access-Control-Allow-Origin: *\r\n\
    Cache-Control: no-cache\r\n\
    Connection: keep-alive\r\n\
    Accept-Ranges: none\r\n\r\n";

struct SseEvent {
    content: String,
    group: String,
}

/// Server-Sent-Events stream. Emits its own header block once, then drains a
/// small event queue one event per service tick; the connection stays open
/// with timeouts disabled until the peer goes away or a send fails.
pub struct SseResponder {
    tx_queue: BoundedQueue<SseEvent>,
    is_initial_response: bool,
    is_active: bool,
    log: Logger,
}

impl SseResponder {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> SseResponder {
        SseResponder {
            tx_queue: BoundedQueue::new(EVENT_TX_QUEUE_SIZE),
            is_initial_response: true,
            is_active: false,
            log: logging::child(log),
        }
    }
}

/// Frame one event for the wire: `id`/`event` lines, one `data` line per
/// content line, blank-line terminated, all CRLF.
fn generate_event_message(content: &str, group: &str, id: u64) -> String {
    let mut message = String::new();
    if id != 0 {
        message.push_str("id: ");
        message.push_str(&id.to_string());
        message.push_str("\r\n");
    }
    if !group.is_empty() {
        message.push_str("event: ");
        message.push_str(group);
        message.push_str("\r\n");
    }
    let mut lines = content.lines();
    let first = lines.next().unwrap_or("");
    message.push_str("data: ");
    message.push_str(first);
    message.push_str("\r\n");
    for line in lines {
        message.push_str("data: ");
        message.push_str(line);
        message.push_str("\r\n");
    }
    message.push_str("\r\n");
    message
}

impl Responder for SseResponder {
    fn start(&mut self, _now: Instant) -> bool {
        self.is_active = true;
        true
    }

    fn service(&mut self, _now: Instant, tx: &mut dyn ConnTx) {
        if let Some(event) = self.tx_queue.get() {
            let message =
                generate_event_message(&event.content, &event.group, timestamp_secs());
            if !tx
                .raw_send(message.as_bytes(), MAX_SSEVENT_SEND_RETRY_MS)
                .is_ok()
            {
                self.is_active = false;
            }
        }
    }

    fn response_available(&self) -> bool {
        self.is_active && self.is_initial_response
    }

    fn response_next(&mut self, _max_len: usize, _now: Instant) -> Vec<u8> {
        if self.is_initial_response {
            self.is_initial_response = false;
            return SSE_PREAMBLE.as_bytes().to_vec();
        }
        Vec::new()
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    fn leave_conn_open(&self) -> bool {
        true
    }

    fn std_header_required(&self) -> bool {
        false
    }

    fn send_event(&mut self, content: &str, group: &str) {
        let event = SseEvent {
            content: content.to_string(),
            group: group.to_string(),
        };
        if !self.tx_queue.put(event) {
            warn!(self.log, "event queue full, dropping event"; "group" => group);
        }
    }

    fn responder_type(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::defs::{ConnTx, SendOutcome};

    struct MockTx {
        sent: Vec<u8>,
        outcome: SendOutcome,
    }

    impl ConnTx for MockTx {
        fn raw_send(&mut self, buf: &[u8], _max_retry_ms: u64) -> SendOutcome {
            self.sent.extend_from_slice(buf);
            self.outcome
        }
    }

    #[test]
    fn test_initial_response_once() {
        let mut responder = SseResponder::new(None);
        responder.start(Instant::now());
        assert!(responder.response_available());
        let first = responder.response_next(5000, Instant::now());
        let first = String::from_utf8(first).unwrap();
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(first.contains("Content-Type: text/event-stream\r\n"));
        assert!(first.contains("Cache-Control: no-cache\r\n"));
        assert!(!responder.response_available());
        assert!(responder.response_next(5000, Instant::now()).is_empty());
    }

    #[test]
    fn test_event_formatting() {
        let message = generate_event_message("hello", "grp", 12345);
        assert_eq!(message, "id: 12345\r\nevent: grp\r\ndata: hello\r\n\r\n");
    }

    #[test]
    fn test_multiline_event_data() {
        let message = generate_event_message("one\ntwo", "g", 7);
        assert_eq!(message, "id: 7\r\nevent: g\r\ndata: one\r\ndata: two\r\n\r\n");
    }

    #[test]
    fn test_events_drain_one_per_tick() {
        let mut responder = SseResponder::new(None);
        responder.start(Instant::now());
        responder.send_event("a", "g");
        responder.send_event("b", "g");

        let mut tx = MockTx { sent: Vec::new(), outcome: SendOutcome::Ok };
        responder.service(Instant::now(), &mut tx);
        let after_first = tx.sent.len();
        assert!(String::from_utf8_lossy(&tx.sent).contains("data: a\r\n"));
        assert!(!String::from_utf8_lossy(&tx.sent).contains("data: b\r\n"));

        responder.service(Instant::now(), &mut tx);
        assert!(tx.sent.len() > after_first);
        assert!(String::from_utf8_lossy(&tx.sent).contains("data: b\r\n"));
    }

    #[test]
    fn test_queue_overflow_drops() {
        let mut responder = SseResponder::new(None);
        responder.start(Instant::now());
        responder.send_event("1", "g");
        responder.send_event("2", "g");
        responder.send_event("3", "g");

        let mut tx = MockTx { sent: Vec::new(), outcome: SendOutcome::Ok };
        responder.service(Instant::now(), &mut tx);
        responder.service(Instant::now(), &mut tx);
        responder.service(Instant::now(), &mut tx);
        let text = String::from_utf8_lossy(&tx.sent).into_owned();
        assert!(text.contains("data: 1\r\n"));
        assert!(text.contains("data: 2\r\n"));
        assert!(!text.contains("data: 3\r\n"));
    }

    #[test]
    fn test_send_failure_deactivates() {
        let mut responder = SseResponder::new(None);
        responder.start(Instant::now());
        responder.send_event("x", "g");
        let mut tx = MockTx { sent: Vec::new(), outcome: SendOutcome::Fail };
        responder.service(Instant::now(), &mut tx);
        assert!(!responder.is_active());
    }

    #[test]
    fn test_keeps_conn_open_without_std_header() {
        let responder = SseResponder::new(None);
        assert!(responder.leave_conn_open());
        assert!(!responder.std_header_required());
    }
}
