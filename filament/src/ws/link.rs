use crate::net::defs::{ConnTx, SendOutcome};
use crate::ws::frame::{self, FrameHeader, OpCode, MASK_KEY_BYTES};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lumen::logging::{self, debug, warn, Logger};
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};

/// Largest reassembled message; longer messages are drained and dropped.
pub const MAX_WS_MESSAGE_SIZE: usize = 500_000;

/// WebSocket sends are not retried; backpressure falls back to the caller.
pub const MAX_WS_SEND_RETRY_MS: u64 = 0;

const WS_HASH_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PING_PAYLOAD: &[u8] = b"RIC\0";
const CLOSE_NORMAL: [u8; 2] = [0x03, 0xe8];

/// Events surfaced to the owner of the link after feeding inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Disconnect,
}

/// Accept-key derivation for the upgrade handshake.
pub fn accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_HASH_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// RFC 6455 framer/deframer bound to one connection. The link does not own
/// the transport; operations that emit bytes take the connection's raw send
/// surface as an argument.
pub struct WebSocketLink {
    ws_key: String,
    #[allow(dead_code)]
    ws_version: String,
    upgrade_req_received: bool,
    upgrade_resp_sent: bool,
    is_active: bool,
    mask_sent_data: bool,
    default_opcode: OpCode,

    ping_interval_ms: u64,
    no_pong_ms: u64,
    ping_last: Option<Instant>,
    pong_last: Option<Instant>,
    warned_no_pong: bool,

    residual: Vec<u8>,
    reassembly: Vec<u8>,
    first_frame_opcode: OpCode,
    ignore_until_final: bool,

    log: Logger,
}

impl WebSocketLink {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        role_is_server: bool,
        is_binary: bool,
        ping_interval_ms: u64,
        no_pong_ms: u64,
        log: L,
    ) -> WebSocketLink {
        WebSocketLink {
            ws_key: String::new(),
            ws_version: String::new(),
            upgrade_req_received: false,
            upgrade_resp_sent: false,
            is_active: true,
            mask_sent_data: !role_is_server,
            default_opcode: if is_binary { OpCode::Binary } else { OpCode::Text },
            ping_interval_ms,
            no_pong_ms,
            ping_last: None,
            pong_last: None,
            warned_no_pong: false,
            residual: Vec::new(),
            reassembly: Vec::new(),
            first_frame_opcode: OpCode::Binary,
            ignore_until_final: false,
            log: logging::child(log),
        }
    }

    /// Record the upgrade request fields extracted from the HTTP header.
    pub fn upgrade_received(&mut self, ws_key: &str, ws_version: &str) {
        self.upgrade_req_received = true;
        self.ws_key = ws_key.to_string();
        self.ws_version = ws_version.to_string();
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    #[inline]
    pub fn is_active_and_upgraded(&self) -> bool {
        self.is_active && self.upgrade_resp_sent
    }

    #[inline]
    pub fn default_opcode(&self) -> OpCode {
        self.default_opcode
    }

    /// True while the upgrade response is waiting to be collected.
    pub fn upgrade_response_pending(&self) -> bool {
        self.upgrade_req_received && !self.upgrade_resp_sent
    }

    /// Produce the upgrade response exactly once. Also arms the ping timer so
    /// the first ping is not sent immediately.
    pub fn take_upgrade_response(&mut self, now: Instant) -> Option<Vec<u8>> {
        if !self.upgrade_response_pending() {
            return None;
        }
        self.upgrade_resp_sent = true;
        self.ping_last = Some(now);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&self.ws_key)
        );
        Some(response.into_bytes())
    }

    /// Ping/pong housekeeping, called once per service tick.
    pub fn service(&mut self, now: Instant, tx: &mut dyn ConnTx) {
        if !self.upgrade_resp_sent || self.ping_interval_ms == 0 {
            return;
        }

        let ping_last = *self.ping_last.get_or_insert(now);
        if now.duration_since(ping_last) >= Duration::from_millis(self.ping_interval_ms) {
            let _ = self.send_msg(OpCode::Ping, PING_PAYLOAD, tx);
            self.ping_last = Some(now);
        }

        // Liveness only arms after the first pong arrives; older peers did
        // not answer pings at all
        if self.no_pong_ms != 0 {
            if let Some(pong_last) = self.pong_last {
                if now.duration_since(pong_last) >= Duration::from_millis(self.no_pong_ms) {
                    if !self.warned_no_pong {
                        warn!(self.log, "no pong received, link inactive";
                              "no_pong_ms" => self.no_pong_ms);
                        self.warned_no_pong = true;
                    }
                    self.is_active = false;
                }
            }
        }
    }

    /// Encode and send one complete message frame.
    pub fn send_msg(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        tx: &mut dyn ConnTx,
    ) -> SendOutcome {
        let mut frame_len = payload.len() + 2;
        if payload.len() > 125 {
            frame_len += 2;
        }
        if payload.len() > 65535 {
            frame_len += 6;
        }
        if self.mask_sent_data {
            frame_len += MASK_KEY_BYTES;
        }
        if frame_len >= MAX_WS_MESSAGE_SIZE {
            warn!(self.log, "send message too long";
                  "frame_len" => frame_len, "max" => MAX_WS_MESSAGE_SIZE);
            return SendOutcome::TooLong;
        }

        let mask_key = if self.mask_sent_data {
            let mut key: [u8; MASK_KEY_BYTES] = rand::random();
            if key == [0; MASK_KEY_BYTES] {
                key = [0x55; MASK_KEY_BYTES];
            }
            Some(key)
        } else {
            None
        };

        let frame = frame::encode_frame(opcode, payload, mask_key);
        tx.raw_send(&frame, MAX_WS_SEND_RETRY_MS)
    }

    /// Feed inbound connection bytes through the deframer. Control frames
    /// are answered on the spot; completed data messages come back as
    /// events. Residual bytes of partial frames are retained between calls.
    pub fn handle_rx(
        &mut self,
        data: &[u8],
        now: Instant,
        tx: &mut dyn ConnTx,
    ) -> Vec<WsEvent> {
        let mut events = Vec::new();
        if !self.upgrade_req_received {
            return events;
        }

        // Prepend residual from earlier partial reads
        let mut buf = std::mem::replace(&mut self.residual, Vec::new());
        if !buf.is_empty() && buf.len() + data.len() > MAX_WS_MESSAGE_SIZE + 50 {
            warn!(self.log, "discarding stashed rx data, exceeds max";
                  "stashed" => buf.len(), "incoming" => data.len());
            buf.clear();
        }
        buf.extend_from_slice(data);

        let mut pos = 0;
        while pos < buf.len() {
            let header = match FrameHeader::extract(&buf[pos..]) {
                Some(header) => header,
                None => break,
            };
            // Checked: a hostile length field must not wrap the arithmetic
            let total = match (header.len as usize).checked_add(header.data_pos) {
                Some(total) => total,
                None => break,
            };
            if total > buf.len() - pos {
                break;
            }
            let payload_start = pos + header.data_pos;
            let mut payload = buf[payload_start..pos + total].to_vec();
            pos += total;

            if self.ignore_until_final {
                // Drop fragments of an over-long message through its FIN
                if header.fin {
                    self.ignore_until_final = false;
                }
                continue;
            }

            if header.mask {
                frame::unmask(&mut payload, header.mask_key);
            }

            match header.opcode {
                OpCode::Continue | OpCode::Text | OpCode::Binary => {
                    if header.opcode != OpCode::Continue {
                        self.reassembly.clear();
                        self.first_frame_opcode = header.opcode;
                    }
                    if self.reassembly.len() + payload.len() > MAX_WS_MESSAGE_SIZE {
                        warn!(self.log, "message exceeds max size, dropping";
                              "max" => MAX_WS_MESSAGE_SIZE);
                        self.reassembly.clear();
                        self.ignore_until_final = !header.fin;
                        continue;
                    }
                    self.reassembly.extend_from_slice(&payload);
                    if header.fin {
                        let message = std::mem::replace(&mut self.reassembly, Vec::new());
                        let event = if self.first_frame_opcode == OpCode::Text {
                            WsEvent::Text(message)
                        } else {
                            WsEvent::Binary(message)
                        };
                        events.push(event);
                    }
                }
                OpCode::Ping => {
                    debug!(self.log, "rx ping, tx pong"; "len" => payload.len());
                    let _ = self.send_msg(OpCode::Pong, &payload, tx);
                    events.push(WsEvent::Ping);
                }
                OpCode::Pong => {
                    self.pong_last = Some(now);
                    self.warned_no_pong = false;
                    events.push(WsEvent::Pong);
                }
                OpCode::Close => {
                    debug!(self.log, "rx close, echoing close");
                    let _ = self.send_msg(OpCode::Close, &CLOSE_NORMAL, tx);
                    self.is_active = false;
                    events.push(WsEvent::Disconnect);
                }
            }
        }

        if pos < buf.len() {
            self.residual = buf[pos..].to_vec();
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTx {
        sent: Vec<u8>,
        outcome: SendOutcome,
    }

    impl MockTx {
        fn new() -> MockTx {
            MockTx { sent: Vec::new(), outcome: SendOutcome::Ok }
        }
    }

    impl ConnTx for MockTx {
        fn raw_send(&mut self, buf: &[u8], _max_retry_ms: u64) -> SendOutcome {
            self.sent.extend_from_slice(buf);
            self.outcome
        }
    }

    fn server_link() -> WebSocketLink {
        let mut link = WebSocketLink::new(true, true, 2000, 5000, None);
        link.upgrade_received("dGhlIHNhbXBsZSBub25jZQ==", "13");
        link
    }

    fn upgraded_link(now: Instant) -> WebSocketLink {
        let mut link = server_link();
        link.take_upgrade_response(now).unwrap();
        link
    }

    #[test]
    fn test_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_response_once() {
        let mut link = server_link();
        assert!(link.upgrade_response_pending());
        let now = Instant::now();
        let response = link.take_upgrade_response(now).unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert!(link.take_upgrade_response(now).is_none());
        assert!(link.is_active_and_upgraded());
    }

    #[test]
    fn test_server_sends_unmasked() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        assert_eq!(link.send_msg(OpCode::Binary, &[1, 2, 3], &mut tx), SendOutcome::Ok);
        assert_eq!(tx.sent, vec![0x82, 0x03, 1, 2, 3]);
    }

    #[test]
    fn test_client_sends_masked() {
        let mut link = WebSocketLink::new(false, true, 0, 0, None);
        link.upgrade_received("key", "13");
        link.take_upgrade_response(Instant::now()).unwrap();
        let mut tx = MockTx::new();
        link.send_msg(OpCode::Binary, &[9, 8, 7], &mut tx);
        assert_eq!(tx.sent[1] & 0x80, 0x80);
        let header = FrameHeader::extract(&tx.sent).unwrap();
        let mut payload = tx.sent[header.data_pos..].to_vec();
        frame::unmask(&mut payload, header.mask_key);
        assert_eq!(payload, vec![9, 8, 7]);
    }

    #[test]
    fn test_send_too_long_rejected() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        let oversize = vec![0u8; MAX_WS_MESSAGE_SIZE];
        assert_eq!(
            link.send_msg(OpCode::Binary, &oversize, &mut tx),
            SendOutcome::TooLong
        );
        assert!(tx.sent.is_empty());
    }

    #[test]
    fn test_masked_binary_frame_delivered_unmasked() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        let frame = frame::encode_frame(OpCode::Binary, &[1, 2, 3], Some([7, 7, 7, 7]));
        let events = link.handle_rx(&frame, now, &mut tx);
        assert_eq!(events, vec![WsEvent::Binary(vec![1, 2, 3])]);
    }

    #[test]
    fn test_partial_frame_retained() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        let frame = frame::encode_frame(OpCode::Binary, &[5, 6, 7, 8], None);
        let events = link.handle_rx(&frame[..3], now, &mut tx);
        assert!(events.is_empty());
        let events = link.handle_rx(&frame[3..], now, &mut tx);
        assert_eq!(events, vec![WsEvent::Binary(vec![5, 6, 7, 8])]);
    }

    #[test]
    fn test_fragmented_text_reassembled() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        // Text "Hel" with FIN clear, then CONTINUE "lo" with FIN set
        let first = vec![0x01, 0x03, b'H', b'e', b'l'];
        let second = vec![0x80, 0x02, b'l', b'o'];
        assert!(link.handle_rx(&first, now, &mut tx).is_empty());
        let events = link.handle_rx(&second, now, &mut tx);
        assert_eq!(events, vec![WsEvent::Text(b"Hello".to_vec())]);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        let ping = frame::encode_frame(OpCode::Ping, b"abc", Some([1, 2, 3, 4]));
        let events = link.handle_rx(&ping, now, &mut tx);
        assert_eq!(events, vec![WsEvent::Ping]);
        // Pong echoes the unmasked payload
        assert_eq!(tx.sent, frame::encode_frame(OpCode::Pong, b"abc", None));
    }

    #[test]
    fn test_close_echoed_and_inactive() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();
        let close = frame::encode_frame(OpCode::Close, &[], None);
        let events = link.handle_rx(&close, now, &mut tx);
        assert_eq!(events, vec![WsEvent::Disconnect]);
        assert!(!link.is_active());
        assert_eq!(tx.sent, frame::encode_frame(OpCode::Close, &[0x03, 0xe8], None));
    }

    #[test]
    fn test_ping_scheduler() {
        let start = Instant::now();
        let mut link = upgraded_link(start);
        let mut tx = MockTx::new();

        link.service(start + Duration::from_millis(1999), &mut tx);
        assert!(tx.sent.is_empty());

        link.service(start + Duration::from_millis(2001), &mut tx);
        assert_eq!(tx.sent, frame::encode_frame(OpCode::Ping, PING_PAYLOAD, None));
    }

    #[test]
    fn test_no_pong_disconnect_arms_after_first_pong() {
        let start = Instant::now();
        let mut link = upgraded_link(start);
        let mut tx = MockTx::new();

        // Without any pong, the link stays active indefinitely
        link.service(start + Duration::from_millis(60_000), &mut tx);
        assert!(link.is_active());

        // After the first pong, a quiet period kills the link
        let pong = frame::encode_frame(OpCode::Pong, &[], None);
        let pong_time = start + Duration::from_millis(60_500);
        link.handle_rx(&pong, pong_time, &mut tx);
        link.service(pong_time + Duration::from_millis(4_999), &mut tx);
        assert!(link.is_active());
        link.service(pong_time + Duration::from_millis(5_001), &mut tx);
        assert!(!link.is_active());
    }

    #[test]
    fn test_oversize_message_drained_until_fin() {
        let now = Instant::now();
        let mut link = upgraded_link(now);
        let mut tx = MockTx::new();

        // Two fragments totalling over the cap: both dropped. The first is a
        // normal encoded frame with its FIN bit cleared.
        let chunk = vec![0xabu8; 300_000];
        let mut first = frame::encode_frame(OpCode::Binary, &chunk, None);
        first[0] &= 0x7f;
        let second = frame::encode_frame(OpCode::Continue, &chunk, None);
        assert!(link.handle_rx(&first, now, &mut tx).is_empty());
        assert!(link.handle_rx(&second, now, &mut tx).is_empty());
        assert!(link.is_active());

        // A subsequent normal message still gets through
        let ok_frame = frame::encode_frame(OpCode::Binary, &[1], None);
        let events = link.handle_rx(&ok_frame, now, &mut tx);
        assert_eq!(events, vec![WsEvent::Binary(vec![1])]);
    }
}
