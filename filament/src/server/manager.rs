use crate::net::client::ClientConn;
use crate::http::types::ConnType;
use crate::server::conn::Connection;
use crate::server::handler::{Handler, HandlerRegistry};
use crate::settings::ServerSettings;
use lumen::logging::{self, debug, warn, Logger};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::time::Instant;

/// Bound on connections accepted but not yet placed in a slot.
pub const NEW_CONN_QUEUE_MAX_LEN: usize = 10;

/// Owns the fixed vector of connection slots, the queue of freshly accepted
/// connections and the handler registry, and drives everything once per
/// service tick. Also the entry point for channel-addressed sends from
/// external producers.
pub struct ConnManager {
    slots: Vec<Connection>,
    registry: HandlerRegistry,
    settings: ServerSettings,
    new_conn_tx: SyncSender<Box<dyn ClientConn>>,
    new_conn_rx: Receiver<Box<dyn ClientConn>>,
    log: Logger,
}

impl ConnManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(settings: ServerSettings, log: L) -> ConnManager {
        let log = logging::child(log);
        let std_headers = settings.std_headers_block();
        let slots = (0..settings.num_conn_slots)
            .map(|_| {
                Connection::new(
                    settings.send_buffer_max_len,
                    settings.clear_pending_ms,
                    std_headers.clone(),
                    &log,
                )
            })
            .collect();
        let (new_conn_tx, new_conn_rx) = sync_channel(NEW_CONN_QUEUE_MAX_LEN);
        ConnManager {
            slots,
            registry: HandlerRegistry::new(&log),
            settings,
            new_conn_tx,
            new_conn_rx,
            log,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Register a route handler, honoring the settings' disable flags.
    pub fn add_handler(&mut self, handler: Box<dyn Handler>, high_priority: bool) -> bool {
        self.registry.add(handler, high_priority, &self.settings)
    }

    /// Producer side of the new-connection queue, for the listener thread.
    /// A full queue refuses the hand-off and the connection is dropped.
    pub fn new_conn_sender(&self) -> SyncSender<Box<dyn ClientConn>> {
        self.new_conn_tx.clone()
    }

    /// Drive all slots once, then take at most one new connection off the
    /// queue and place it in a free slot.
    pub fn service(&mut self, now: Instant) {
        let registry = &self.registry;
        let settings = &self.settings;
        for conn in self.slots.iter_mut() {
            conn.service(now, registry, settings);
        }

        match self.new_conn_rx.try_recv() {
            Ok(client) => {
                if !self.accommodate_connection(client, now) {
                    // Dropping the refused connection closes its socket
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
    }

    fn accommodate_connection(&mut self, client: Box<dyn ClientConn>, now: Instant) -> bool {
        let conn_id = client.client_id();
        for conn in self.slots.iter_mut() {
            if conn.is_active() {
                continue;
            }
            debug!(self.log, "conn accommodated"; "conn_id" => conn_id);
            return conn.set_new_conn(client, now);
        }
        warn!(self.log, "no empty slot for connection"; "conn_id" => conn_id);
        false
    }

    /// Number of slots currently free.
    pub fn free_slot_count(&self) -> usize {
        self.slots.iter().filter(|conn| !conn.is_active()).count()
    }

    /// Queue application data for the responder owning `channel_id`.
    pub fn send_on_channel(&mut self, data: &[u8], channel_id: u32) -> bool {
        let now = Instant::now();
        let mut send_ok = false;
        for conn in self.slots.iter_mut() {
            if !conn.is_active() {
                continue;
            }
            if conn.responder_channel_id() != Some(channel_id) {
                continue;
            }
            send_ok = conn.encode_and_send(data, now);
        }
        send_ok
    }

    /// Probe channel readiness. `no_conn` is set only when the channel no
    /// longer exists, signalling that the producer may discard its message.
    pub fn can_send_on_channel(&mut self, channel_id: u32) -> (bool, bool) {
        for conn in self.slots.iter_mut() {
            if !conn.is_active() {
                continue;
            }
            if conn.responder_channel_id() != Some(channel_id) {
                continue;
            }
            return (conn.channel_ready_to_send(), false);
        }
        (false, true)
    }

    /// Broadcast a server-sent event to every live event-stream connection.
    pub fn send_sse_event(&mut self, content: &str, group: &str) {
        for conn in self.slots.iter_mut() {
            if !conn.is_active() {
                continue;
            }
            if conn.header().conn_type == ConnType::Event {
                conn.send_sse_event(content, group);
            }
        }
    }
}
