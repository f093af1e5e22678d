use crate::http::header::RequestHeader;
use crate::http::parser::HeaderParser;
use crate::http::types::{HttpStatus, Method};
use crate::net::buffer::TxQueue;
use crate::net::client::ClientConn;
use crate::net::defs::{ConnTx, RecvOutcome, SendOutcome};
use crate::server::handler::HandlerRegistry;
use crate::server::responder::Responder;
use crate::server::responder_data::DataResponder;
use crate::settings::ServerSettings;
use lumen::logging::{self, debug, warn, Logger};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Absolute cap on a standard connection's lifetime.
pub const MAX_STD_CONN_DURATION_MS: u64 = 60 * 60 * 1000;
/// Idle cap, measured against the last successful rx or tx activity.
pub const MAX_CONN_IDLE_DURATION_MS: u64 = 60 * 1000;
/// Retry budget for header-sized sends (status lines, 100-continue).
pub const MAX_HEADER_SEND_RETRY_MS: u64 = 10;
/// Content sends do not block; backpressure goes through the tx queue.
pub const MAX_CONTENT_SEND_RETRY_MS: u64 = 0;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const PREFLIGHT_HEADERS: &str = "Access-Control-Allow-Methods: GET,HEAD,PUT,PATCH,POST,DELETE\r\n\
    Access-Control-Allow-Headers: *\r\n\
    Vary: Access-Control-Request-Headers\r\n\
    Content-Length: 0\r\n";

/// Send/probe surface over a slot's socket and transmit queue, handed to
/// responders and used internally for header emission. Ordering is
/// preserved: queued bytes always drain before new bytes are attempted.
struct ConnSender<'a> {
    client: &'a mut dyn ClientConn,
    queue: &'a mut TxQueue,
}

impl<'a> ConnTx for ConnSender<'a> {
    fn raw_send(&mut self, buf: &[u8], max_retry_ms: u64) -> SendOutcome {
        if !drain_tx_queue(self.client, self.queue) {
            return SendOutcome::Fail;
        }
        let mut written = 0;
        if self.queue.is_empty() {
            let (outcome, count) = self.client.send(buf, max_retry_ms);
            match outcome {
                SendOutcome::Ok if count == buf.len() => return SendOutcome::Ok,
                SendOutcome::Ok | SendOutcome::EAgain => written = count,
                other => return other,
            }
        }
        // Queue the remainder; overflow fails the send outright
        if !self.queue.append(&buf[written..]) {
            return SendOutcome::Fail;
        }
        SendOutcome::Ok
    }

    fn can_send(&mut self) -> SendOutcome {
        // Don't accept more data while the queue holds unsent bytes
        if !self.queue.is_empty() {
            return SendOutcome::EAgain;
        }
        self.client.can_send()
    }
}

/// Push queued bytes to the socket. EAgain leaves the queue intact; a send
/// failure discards it and reports the connection dead.
fn drain_tx_queue(client: &mut dyn ClientConn, queue: &mut TxQueue) -> bool {
    if queue.is_empty() {
        return true;
    }
    let (outcome, written) = client.send(queue.data(), MAX_CONTENT_SEND_RETRY_MS);
    match outcome {
        SendOutcome::EAgain => true,
        SendOutcome::Ok => {
            queue.consume(written);
            true
        }
        _ => {
            queue.clear();
            false
        }
    }
}

fn build_standard_headers(
    status: HttpStatus,
    method: Method,
    std_headers: &str,
    responder: Option<&dyn Responder>,
) -> String {
    let mut block = format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason());

    if method == Method::Options {
        block.push_str(PREFLIGHT_HEADERS);
    }

    if let Some(responder) = responder {
        let content_type = responder.content_type();
        if !content_type.is_empty() {
            block.push_str("Content-Type: ");
            block.push_str(content_type);
            block.push_str("\r\n");
        }
    }

    block.push_str(std_headers);

    if let Some(responder) = responder {
        for (name, value) in responder.extra_headers() {
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        if let Some(content_length) = responder.content_length() {
            block.push_str("Content-Length: ");
            block.push_str(&content_length.to_string());
            block.push_str("\r\n");
        }
    }

    let keep_open = responder.map(|r| r.leave_conn_open()).unwrap_or(false);
    if !keep_open {
        block.push_str("Connection: close\r\n");
    }

    block.push_str("\r\n");
    block
}

/// One connection slot: glues the socket, the header parser, the transmit
/// queue and at most one responder together, and walks the request through
/// parse -> respond -> drain -> clear on successive service ticks.
pub struct Connection {
    client: Option<Box<dyn ClientConn>>,
    responder: Option<Box<dyn Responder>>,
    header: RequestHeader,
    parser: HeaderParser,
    tx_queue: TxQueue,
    status: HttpStatus,
    std_header_required: bool,

    timeout_active: bool,
    created_at: Instant,
    last_activity_at: Instant,
    clear_pending: bool,
    clear_pending_at: Instant,
    clear_pending_ms: u64,

    max_send_len: usize,
    std_headers: String,
    log: Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        max_send_len: usize,
        clear_pending_ms: u64,
        std_headers: String,
        log: L,
    ) -> Connection {
        let now = Instant::now();
        Connection {
            client: None,
            responder: None,
            header: RequestHeader::new(),
            parser: HeaderParser::new(),
            tx_queue: TxQueue::new(max_send_len),
            status: HttpStatus::Ok,
            std_header_required: true,
            timeout_active: false,
            created_at: now,
            last_activity_at: now,
            clear_pending: false,
            clear_pending_at: now,
            clear_pending_ms,
            max_send_len,
            std_headers,
            log: logging::child(log),
        }
    }

    /// Attach an accepted connection to this (empty) slot.
    pub fn set_new_conn(&mut self, mut client: Box<dyn ClientConn>, now: Instant) -> bool {
        if self.client.is_some() {
            warn!(self.log, "slot already holds a connection";
                  "existing_conn" => self.client.as_ref().map(|c| c.client_id()).unwrap_or(0));
            return false;
        }
        self.clear();
        client.setup(false);
        debug!(self.log, "conn attached"; "conn_id" => client.client_id());
        self.client = Some(client);
        self.created_at = now;
        self.last_activity_at = now;
        self.timeout_active = true;
        true
    }

    /// True while the slot holds a live connection.
    pub fn is_active(&self) -> bool {
        self.client.as_ref().map(|client| client.is_active()).unwrap_or(false)
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn responder_channel_id(&self) -> Option<u32> {
        self.responder.as_ref().and_then(|responder| responder.channel_id())
    }

    /// Release everything and make the slot reusable.
    pub fn clear(&mut self) {
        // Dropping the responder releases any channel id; dropping the
        // client closes the socket
        self.responder = None;
        self.client = None;
        self.header.clear();
        self.parser.clear();
        self.tx_queue.clear();
        self.status = HttpStatus::Ok;
        self.std_header_required = true;
        self.timeout_active = false;
        self.clear_pending = false;
    }

    /// Enter the clear-pending grace window (or clear at once when no grace
    /// is configured) so final bytes can drain.
    fn clear_after_send_completion(&mut self, now: Instant) {
        if self.clear_pending_ms > 0 {
            self.clear_pending = true;
            self.clear_pending_at = now;
        } else {
            self.clear();
        }
    }

    /// Drive this slot once. Called on every tick of the service loop.
    pub fn service(&mut self, now: Instant, registry: &HandlerRegistry, settings: &ServerSettings) {
        if self.client.is_none() {
            return;
        }

        // Push out anything already queued
        {
            let Connection { client, tx_queue, .. } = self;
            if let Some(client) = client.as_mut() {
                drain_tx_queue(client.as_mut(), tx_queue);
            }
        }

        if self.clear_pending {
            if now.duration_since(self.clear_pending_at)
                >= Duration::from_millis(self.clear_pending_ms)
            {
                self.clear();
            }
            return;
        }

        if self.timeout_active {
            let total_expired = now.duration_since(self.created_at)
                >= Duration::from_millis(MAX_STD_CONN_DURATION_MS);
            let idle_expired = now.duration_since(self.last_activity_at)
                >= Duration::from_millis(MAX_CONN_IDLE_DURATION_MS);
            if total_expired || idle_expired {
                warn!(self.log, "conn timeout";
                      "conn_id" => self.client.as_ref().map(|c| c.client_id()).unwrap_or(0),
                      "idle" => idle_expired);
                self.clear();
                return;
            }
        }

        // Service the responder; it also gates whether we read more data
        let mut check_for_new_data = true;
        {
            let Connection { client, responder, tx_queue, .. } = self;
            if let (Some(responder), Some(client)) = (responder.as_mut(), client.as_mut()) {
                let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };
                responder.service(now, &mut sender);
                check_for_new_data = responder.ready_to_receive();
            }
        }

        let mut close_required = false;
        let mut error_occurred = false;
        let mut rx_data = Vec::new();
        if check_for_new_data {
            if let Some(client) = self.client.as_mut() {
                match client.recv_start(&mut rx_data) {
                    RecvOutcome::Ok => {}
                    RecvOutcome::ConnClosed => close_required = true,
                    RecvOutcome::Error => error_occurred = true,
                }
            }
        }
        let data_available = !rx_data.is_empty();
        if data_available {
            self.last_activity_at = now;
        }

        let mut buf_pos = 0;
        let header_was_complete = self.header.is_complete;
        if data_available && !self.header.is_complete {
            if !self.service_conn_header(&rx_data, &mut buf_pos, now, registry, settings) {
                if self.status == HttpStatus::BadRequest {
                    // Malformed request: answer 400 and close gracefully
                    let _ = self.send_standard_headers();
                    self.std_header_required = false;
                    self.clear_after_send_completion(now);
                    return;
                }
                error_occurred = true;
            }
        }

        if !self.responder_handle_data(&rx_data, buf_pos, header_was_complete, now) {
            close_required = true;
        }

        if check_for_new_data {
            if let Some(client) = self.client.as_mut() {
                client.recv_end();
            }
        }

        if error_occurred {
            debug!(self.log, "conn error, clearing");
            self.clear();
        } else if close_required {
            self.clear_after_send_completion(now);
        }
    }

    /// Feed received bytes into the header parser; once the header
    /// completes, answer 100-continue, short-circuit OPTIONS and find a
    /// responder. Returns false on failures that must drop the connection.
    fn service_conn_header(
        &mut self,
        rx_data: &[u8],
        buf_pos: &mut usize,
        now: Instant,
        registry: &HandlerRegistry,
        settings: &ServerSettings,
    ) -> bool {
        match self.parser.handle_data(&mut self.header, rx_data) {
            Ok(pos) => *buf_pos = pos,
            Err(_) => {
                warn!(self.log, "bad request header");
                self.status = HttpStatus::BadRequest;
                return false;
            }
        }
        if !self.header.is_complete {
            return true;
        }

        if self.header.is_continue {
            let sent = {
                let Connection { client, tx_queue, .. } = self;
                match client.as_mut() {
                    Some(client) => {
                        let mut sender =
                            ConnSender { client: client.as_mut(), queue: tx_queue };
                        sender.raw_send(CONTINUE_RESPONSE, MAX_HEADER_SEND_RETRY_MS).is_ok()
                    }
                    None => false,
                }
            };
            if !sent {
                return false;
            }
        }

        // Pre-flight requests get a bare 204 with CORS headers
        if self.header.method == Method::Options {
            self.status = HttpStatus::NoContent;
            return true;
        }

        let mut status = HttpStatus::NotFound;
        match registry.get_new_responder(&self.header, settings, &mut status) {
            Some(mut responder) => {
                debug!(self.log, "responder created";
                       "type" => responder.responder_type(), "url" => %self.header.url);
                self.status = status;
                // Long-running responders are exempt from timeouts
                if responder.leave_conn_open() {
                    self.timeout_active = false;
                }
                responder.start(now);
                self.responder = Some(responder);
            }
            None => {
                if status == HttpStatus::NotFound && !settings.page_404_source.is_empty() {
                    let mut responder = DataResponder::new(
                        Arc::new(settings.page_404_source.clone().into_bytes()),
                        "text/html",
                    );
                    responder.start(now);
                    self.responder = Some(Box::new(responder));
                    self.status = HttpStatus::NotFound;
                } else {
                    debug!(self.log, "no responder"; "url" => %self.header.url,
                           "status" => status.code());
                    self.status = status;
                }
            }
        }
        true
    }

    /// Hand inbound bytes to the responder and push response data. Returns
    /// false when the connection should close (response complete, no
    /// responder, or a send failure).
    fn responder_handle_data(
        &mut self,
        rx_data: &[u8],
        buf_pos: usize,
        do_respond: bool,
        now: Instant,
    ) -> bool {
        {
            let Connection { client, responder, tx_queue, .. } = self;
            if let (Some(responder), Some(client)) = (responder.as_mut(), client.as_mut()) {
                let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };
                if buf_pos < rx_data.len() {
                    responder.handle_inbound(&rx_data[buf_pos..], now, &mut sender);
                }
                responder.service(now, &mut sender);
            }
        }

        // On the tick the header completed we only parse; responding starts
        // on the next tick
        if !do_respond {
            return true;
        }

        let mut error_occurred = false;
        let is_active = self.responder.as_ref().map(|r| r.is_active()).unwrap_or(false);
        if is_active {
            if !self.handle_response_chunk(now) {
                error_occurred = true;
            }
            self.last_activity_at = now;
        }

        let responder_wants_std = self
            .responder
            .as_ref()
            .map(|r| r.std_header_required())
            .unwrap_or(true);
        if !is_active && self.std_header_required && responder_wants_std {
            if !self.send_standard_headers() {
                error_occurred = true;
            }
            self.std_header_required = false;
        }

        if self.responder.is_none() || error_occurred {
            return false;
        }
        self.responder.as_ref().map(|r| r.is_active()).unwrap_or(false)
    }

    /// Emit the standard headers (exactly once per response) and the next
    /// chunk of responder output, respecting socket backpressure.
    fn handle_response_chunk(&mut self, now: Instant) -> bool {
        let Connection {
            client,
            responder,
            tx_queue,
            std_header_required,
            status,
            header,
            std_headers,
            max_send_len,
            ..
        } = self;
        let responder = match responder.as_mut() {
            Some(responder) => responder,
            None => return true,
        };
        let client = match client.as_mut() {
            Some(client) => client,
            None => return false,
        };
        let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };

        let std_needed = *std_header_required && responder.std_header_required();
        if !(std_needed || responder.response_available()) {
            return true;
        }

        match sender.can_send() {
            SendOutcome::EAgain => return true,
            SendOutcome::Ok => {}
            _ => return false,
        }

        if std_needed {
            let block = build_standard_headers(
                *status,
                header.method,
                std_headers,
                Some(responder.as_ref()),
            );
            if !sender.raw_send(block.as_bytes(), MAX_HEADER_SEND_RETRY_MS).is_ok() {
                return false;
            }
            *std_header_required = false;
        }

        // Only pull the next chunk when nothing is waiting to drain
        if sender.queue.is_empty() {
            let chunk = responder.response_next(*max_send_len, now);
            if !chunk.is_empty() {
                let outcome = sender.raw_send(&chunk, MAX_CONTENT_SEND_RETRY_MS);
                if outcome != SendOutcome::Ok && outcome != SendOutcome::EAgain {
                    return false;
                }
            }
        }
        true
    }

    fn send_standard_headers(&mut self) -> bool {
        let Connection { client, responder, tx_queue, status, header, std_headers, .. } = self;
        let client = match client.as_mut() {
            Some(client) => client,
            None => return false,
        };
        let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };
        let block = build_standard_headers(
            *status,
            header.method,
            std_headers,
            responder.as_ref().map(|r| r.as_ref()),
        );
        sender.raw_send(block.as_bytes(), MAX_HEADER_SEND_RETRY_MS).is_ok()
    }

    /// Queue application data on this slot's channel responder.
    pub fn encode_and_send(&mut self, data: &[u8], now: Instant) -> bool {
        let Connection { client, responder, tx_queue, .. } = self;
        if let (Some(responder), Some(client)) = (responder.as_mut(), client.as_mut()) {
            let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };
            responder.encode_and_send(data, now, &mut sender)
        } else {
            false
        }
    }

    /// Readiness of this slot's channel responder.
    pub fn channel_ready_to_send(&mut self) -> bool {
        let Connection { client, responder, tx_queue, .. } = self;
        if let (Some(responder), Some(client)) = (responder.as_mut(), client.as_mut()) {
            let mut sender = ConnSender { client: client.as_mut(), queue: tx_queue };
            responder.ready_to_send(&mut sender)
        } else {
            false
        }
    }

    /// Queue a server-sent event on this slot's responder.
    pub fn send_sse_event(&mut self, content: &str, group: &str) {
        if let Some(responder) = self.responder.as_mut() {
            responder.send_event(content, group);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_clear_pending(&self) -> bool {
        self.clear_pending
    }

    #[cfg(test)]
    pub(crate) fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }
}
