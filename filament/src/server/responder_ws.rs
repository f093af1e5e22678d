use crate::server::handler::{ChannelIdTable, InboundSink};
use crate::server::responder::{ConnTx, Responder};
use crate::ws::link::{WebSocketLink, WsEvent};
use lumen::logging::{self, debug, warn, Logger};
use lumen::queue::BoundedQueue;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Channel state as seen by external producers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WsConnStatus {
    /// Handshake in progress; no application data yet.
    Connecting,
    Active,
    Inactive,
}

/// WebSocket responder: wraps a protocol link, owns the outbound frame queue
/// and forwards inbound messages to the external bus keyed by channel id.
/// The channel id is released the moment the link goes inactive (or on drop)
/// so the peer can reconnect immediately.
pub struct WsResponder {
    link: WebSocketLink,
    status: WsConnStatus,
    channel_id: u32,
    packet_max_bytes: usize,
    tx_queue: BoundedQueue<Vec<u8>>,
    inbound: Arc<dyn InboundSink>,
    channel_table: Arc<Mutex<ChannelIdTable>>,
    slot_freed: bool,
    log: Logger,
}

impl WsResponder {
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        ws_key: &str,
        ws_version: &str,
        channel_id: u32,
        packet_max_bytes: usize,
        tx_queue_max: usize,
        ping_ms: u64,
        no_pong_ms: u64,
        is_binary: bool,
        inbound: Arc<dyn InboundSink>,
        channel_table: Arc<Mutex<ChannelIdTable>>,
        log: L,
    ) -> WsResponder {
        let log = logging::child(log);
        let mut link = WebSocketLink::new(true, is_binary, ping_ms, no_pong_ms, &log);
        link.upgrade_received(ws_key, ws_version);
        WsResponder {
            link,
            status: WsConnStatus::Connecting,
            channel_id,
            packet_max_bytes,
            tx_queue: BoundedQueue::new(tx_queue_max),
            inbound,
            channel_table,
            slot_freed: false,
            log,
        }
    }

    pub fn status(&self) -> WsConnStatus {
        self.status
    }

    fn mark_inactive(&mut self) {
        self.status = WsConnStatus::Inactive;
        if !self.slot_freed {
            if let Ok(mut table) = self.channel_table.lock() {
                table.release(self.channel_id);
            }
            self.slot_freed = true;
            debug!(self.log, "ws channel released"; "channel_id" => self.channel_id);
        }
    }
}

impl Drop for WsResponder {
    fn drop(&mut self) {
        self.mark_inactive();
    }
}

impl Responder for WsResponder {
    fn start(&mut self, _now: Instant) -> bool {
        self.status = WsConnStatus::Connecting;
        true
    }

    fn service(&mut self, now: Instant, tx: &mut dyn ConnTx) {
        self.link.service(now, tx);
        if !self.link.is_active() {
            self.mark_inactive();
            return;
        }

        // Drain one queued outbound frame per tick
        if let Some(frame) = self.tx_queue.get() {
            let opcode = self.link.default_opcode();
            let outcome = self.link.send_msg(opcode, &frame, tx);
            if outcome == crate::net::defs::SendOutcome::Fail {
                warn!(self.log, "ws send failed, link inactive";
                      "channel_id" => self.channel_id);
                self.mark_inactive();
            }
        }
    }

    fn handle_inbound(&mut self, data: &[u8], now: Instant, tx: &mut dyn ConnTx) -> bool {
        let events = self.link.handle_rx(data, now, tx);
        for event in events {
            match event {
                WsEvent::Text(payload) | WsEvent::Binary(payload) => {
                    self.inbound.handle(self.channel_id, &payload);
                }
                WsEvent::Ping | WsEvent::Pong => {}
                WsEvent::Disconnect => {}
            }
        }
        if !self.link.is_active() {
            self.mark_inactive();
        }
        true
    }

    fn response_available(&self) -> bool {
        self.status == WsConnStatus::Connecting && self.link.upgrade_response_pending()
    }

    fn response_next(&mut self, _max_len: usize, now: Instant) -> Vec<u8> {
        match self.link.take_upgrade_response(now) {
            Some(response) => {
                if self.status == WsConnStatus::Connecting {
                    self.status = WsConnStatus::Active;
                    debug!(self.log, "ws upgrade response sent, channel active";
                           "channel_id" => self.channel_id);
                }
                response
            }
            None => Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.status != WsConnStatus::Inactive
    }

    fn ready_to_receive(&self) -> bool {
        self.inbound.can_accept(self.channel_id)
    }

    fn ready_to_send(&mut self, tx: &mut dyn ConnTx) -> bool {
        self.link.is_active_and_upgraded() && tx.can_send().is_ok()
    }

    fn leave_conn_open(&self) -> bool {
        !self.slot_freed
    }

    fn std_header_required(&self) -> bool {
        false
    }

    fn channel_id(&self) -> Option<u32> {
        Some(self.channel_id)
    }

    fn encode_and_send(&mut self, data: &[u8], _now: Instant, _tx: &mut dyn ConnTx) -> bool {
        if self.status != WsConnStatus::Active {
            warn!(self.log, "ws send rejected, channel not active";
                  "channel_id" => self.channel_id);
            return false;
        }
        if data.len() > self.packet_max_bytes {
            warn!(self.log, "ws send rejected, packet too big";
                  "len" => data.len(), "max" => self.packet_max_bytes);
            return false;
        }
        if !self.tx_queue.put(data.to_vec()) {
            warn!(self.log, "ws tx queue full"; "channel_id" => self.channel_id);
            return false;
        }
        true
    }

    fn responder_type(&self) -> &'static str {
        "ws"
    }
}
