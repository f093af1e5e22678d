use crate::fs::FileSystem;
use crate::http::header::RequestHeader;
use crate::http::types::{ConnType, HttpStatus, Method};
use crate::server::endpoint::EndpointRegistry;
use crate::server::responder::Responder;
use crate::server::responder_data::DataResponder;
use crate::server::responder_file::FileResponder;
use crate::server::responder_rest::RestApiResponder;
use crate::server::responder_sse::SseResponder;
use crate::server::responder_ws::WsResponder;
use crate::settings::{ServerSettings, WsContent, WsEndpointSettings};
use hashbrown::HashMap;
use lumen::logging::{self, debug, warn, Logger};
use std::sync::{Arc, Mutex};

/// External message bus the WebSocket channels forward inbound frames to.
pub trait InboundSink: Send + Sync {
    fn can_accept(&self, _channel_id: u32) -> bool {
        true
    }
    fn handle(&self, channel_id: u32, data: &[u8]);
}

/// Fixed pool of channel ids for one WebSocket handler. An id is reserved
/// when a responder is created and released when it goes away.
pub struct ChannelIdTable {
    slots: Vec<(u32, bool)>,
}

impl ChannelIdTable {
    pub fn new(base_id: u32, count: usize) -> ChannelIdTable {
        ChannelIdTable {
            slots: (0..count as u32).map(|index| (base_id + index, false)).collect(),
        }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        for (channel_id, in_use) in self.slots.iter_mut() {
            if !*in_use {
                *in_use = true;
                return Some(*channel_id);
            }
        }
        None
    }

    pub fn release(&mut self, channel_id: u32) {
        for (stored, in_use) in self.slots.iter_mut() {
            if *stored == channel_id && *in_use {
                *in_use = false;
                return;
            }
        }
    }

    pub fn is_in_use(&self, channel_id: u32) -> bool {
        self.slots
            .iter()
            .any(|(stored, in_use)| *stored == channel_id && *in_use)
    }
}

/// A route handler: asked, in registry order, whether it produces a
/// responder for a request.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    /// Return a responder for this request, or None. A handler that matched
    /// but cannot serve sets `status` to something other than NotFound.
    fn get_new_responder(
        &self,
        header: &RequestHeader,
        settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>>;

    fn is_file_handler(&self) -> bool {
        false
    }

    fn is_ws_handler(&self) -> bool {
        false
    }
}

/// Ordered list of handlers. File handlers always sort behind the rest;
/// high-priority handlers go to the head of the non-file group.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
    log: Logger,
}

impl HandlerRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Vec::new(),
            log: logging::child(log),
        }
    }

    /// Add a handler, honoring the disable flags in settings. Returns false
    /// when the handler kind is disabled and was not added.
    pub fn add(
        &mut self,
        handler: Box<dyn Handler>,
        high_priority: bool,
        settings: &ServerSettings,
    ) -> bool {
        if handler.is_file_handler() && !settings.enable_file_server {
            debug!(self.log, "not adding handler, file server disabled";
                   "handler" => handler.name());
            return false;
        }
        if handler.is_ws_handler() && !settings.enable_websockets {
            debug!(self.log, "not adding handler, websockets disabled";
                   "handler" => handler.name());
            return false;
        }

        debug!(self.log, "adding handler"; "handler" => handler.name());
        if handler.is_file_handler() {
            self.handlers.push(handler);
        } else {
            let insert_at = if high_priority {
                0
            } else {
                self.handlers
                    .iter()
                    .position(|existing| existing.is_file_handler())
                    .unwrap_or_else(|| self.handlers.len())
            };
            self.handlers.insert(insert_at, handler);
        }
        true
    }

    /// Walk the handlers for a responder. The status defaults to NotFound;
    /// the walk stops early when a handler reports a different status
    /// without producing a responder.
    pub fn get_new_responder(
        &self,
        header: &RequestHeader,
        settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        *status = HttpStatus::NotFound;
        for handler in &self.handlers {
            if let Some(responder) = handler.get_new_responder(header, settings, status) {
                return Some(responder);
            }
            if *status != HttpStatus::NotFound {
                break;
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }
}

/// REST API handler: matches the configured prefix and resolves endpoints
/// through the registry boundary.
pub struct RestApiHandler {
    prefix: String,
    registry: Arc<dyn EndpointRegistry>,
    log: Logger,
}

impl RestApiHandler {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        prefix: &str,
        registry: Arc<dyn EndpointRegistry>,
        log: L,
    ) -> RestApiHandler {
        RestApiHandler {
            prefix: prefix.to_string(),
            registry,
            log: logging::child(log),
        }
    }
}

impl Handler for RestApiHandler {
    fn name(&self) -> &'static str {
        "HandlerRestAPI"
    }

    fn get_new_responder(
        &self,
        header: &RequestHeader,
        settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        if !header.url.starts_with(&self.prefix) {
            return None;
        }
        let req_str = &header.uri_and_params[self.prefix.len().min(header.uri_and_params.len())..];
        let endpoint = match self.registry.lookup(req_str, header.method) {
            Some(endpoint) => endpoint,
            None => {
                debug!(self.log, "no matching endpoint"; "req" => req_str);
                return None;
            }
        };
        let boundary = if header.is_multipart {
            Some(header.multipart_boundary.as_str())
        } else {
            None
        };
        *status = HttpStatus::Ok;
        Some(Box::new(RestApiResponder::new(
            endpoint,
            req_str,
            header.method,
            header.content_length,
            boundary,
            &self.log,
        )))
    }
}

/// Serves files from the filesystem boundary under configured uri=path
/// mounts. Always consulted last.
pub struct StaticFileHandler {
    serve_pairs: Vec<(String, String)>,
    fs: Arc<dyn FileSystem>,
    mime_overrides: HashMap<String, String>,
    cache_control: Option<String>,
    log: Logger,
}

impl StaticFileHandler {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        settings: &ServerSettings,
        fs: Arc<dyn FileSystem>,
        cache_control: Option<&str>,
        log: L,
    ) -> StaticFileHandler {
        StaticFileHandler {
            serve_pairs: settings.serve_path_pairs(),
            fs,
            mime_overrides: settings.mime_type_pairs().into_iter().collect(),
            cache_control: cache_control.map(str::to_string),
            log: logging::child(log),
        }
    }

    /// Longest-prefix mount match, mapping the URL onto a filesystem path.
    fn resolve_path(&self, url: &str) -> Option<String> {
        let mut best: Option<&(String, String)> = None;
        for pair in &self.serve_pairs {
            if url.starts_with(pair.0.as_str())
                && best.map(|b| pair.0.len() > b.0.len()).unwrap_or(true)
            {
                best = Some(pair);
            }
        }
        let (uri, fs_path) = best?;
        if url == "/" {
            return Some(format!("{}/index.html", fs_path));
        }
        let rel = url[uri.len()..].trim_start_matches('/');
        Some(format!("{}/{}", fs_path, rel))
    }
}

impl Handler for StaticFileHandler {
    fn name(&self) -> &'static str {
        "HandlerStaticFiles"
    }

    fn is_file_handler(&self) -> bool {
        true
    }

    fn get_new_responder(
        &self,
        header: &RequestHeader,
        settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        if header.method != Method::Get || header.conn_type != ConnType::Http {
            return None;
        }
        let file_path = self.resolve_path(&header.url)?;
        let responder = FileResponder::new(
            self.fs.as_ref(),
            &file_path,
            header,
            &self.mime_overrides,
            self.cache_control.as_deref(),
            &self.log,
        );
        if !responder.is_active() {
            // File not found; leave the status at NotFound
            return None;
        }
        *status = HttpStatus::Ok;
        Some(Box::new(responder))
    }
}

/// Serves one fixed in-memory resource under a base URI.
pub struct StaticDataHandler {
    base_uri: String,
    data: Arc<Vec<u8>>,
    mime_type: String,
}

impl StaticDataHandler {
    pub fn new(base_uri: &str, data: Vec<u8>, mime_type: &str) -> StaticDataHandler {
        let mut base_uri = if base_uri.starts_with('/') {
            base_uri.to_string()
        } else {
            format!("/{}", base_uri)
        };
        if base_uri.len() > 1 && base_uri.ends_with('/') {
            base_uri.pop();
        }
        StaticDataHandler {
            base_uri,
            data: Arc::new(data),
            mime_type: mime_type.to_string(),
        }
    }
}

impl Handler for StaticDataHandler {
    fn name(&self) -> &'static str {
        "HandlerStaticData"
    }

    fn get_new_responder(
        &self,
        header: &RequestHeader,
        _settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        if header.method != Method::Get || header.conn_type != ConnType::Http {
            return None;
        }
        if header.url != self.base_uri {
            return None;
        }
        *status = HttpStatus::Ok;
        Some(Box::new(DataResponder::new(
            Arc::clone(&self.data),
            &self.mime_type,
        )))
    }
}

/// Server-Sent-Events handler: matches event-stream requests on a prefix.
pub struct SseHandler {
    prefix: String,
    log: Logger,
}

impl SseHandler {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(prefix: &str, log: L) -> SseHandler {
        SseHandler {
            prefix: prefix.to_string(),
            log: logging::child(log),
        }
    }
}

impl Handler for SseHandler {
    fn name(&self) -> &'static str {
        "HandlerSSEvents"
    }

    fn get_new_responder(
        &self,
        header: &RequestHeader,
        _settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        if header.conn_type != ConnType::Event {
            return None;
        }
        if !header.url.starts_with(&self.prefix) {
            return None;
        }
        *status = HttpStatus::Ok;
        Some(Box::new(SseResponder::new(&self.log)))
    }
}

/// WebSocket handler: one per configured endpoint, owning that endpoint's
/// channel id pool.
pub struct WsHandler {
    config: WsEndpointSettings,
    prefix: String,
    channel_table: Arc<Mutex<ChannelIdTable>>,
    inbound: Arc<dyn InboundSink>,
    log: Logger,
}

impl WsHandler {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: WsEndpointSettings,
        inbound: Arc<dyn InboundSink>,
        log: L,
    ) -> WsHandler {
        let prefix = if config.prefix.starts_with('/') {
            config.prefix.clone()
        } else {
            format!("/{}", config.prefix)
        };
        let channel_table = Arc::new(Mutex::new(ChannelIdTable::new(
            config.channel_id_base,
            config.max_conn,
        )));
        WsHandler {
            config,
            prefix,
            channel_table,
            inbound,
            log: logging::child(log),
        }
    }

    pub fn channel_table(&self) -> Arc<Mutex<ChannelIdTable>> {
        Arc::clone(&self.channel_table)
    }
}

impl Handler for WsHandler {
    fn name(&self) -> &'static str {
        "HandlerWS"
    }

    fn is_ws_handler(&self) -> bool {
        true
    }

    fn get_new_responder(
        &self,
        header: &RequestHeader,
        _settings: &ServerSettings,
        status: &mut HttpStatus,
    ) -> Option<Box<dyn Responder>> {
        if header.conn_type != ConnType::WebSocket {
            return None;
        }
        if !header.url.starts_with(&self.prefix) {
            return None;
        }

        let channel_id = match self.channel_table.lock() {
            Ok(mut table) => table.allocate(),
            Err(_) => None,
        };
        let channel_id = match channel_id {
            Some(channel_id) => channel_id,
            None => {
                warn!(self.log, "no free ws connections"; "prefix" => %self.prefix);
                *status = HttpStatus::ServiceUnavailable;
                return None;
            }
        };

        *status = HttpStatus::Ok;
        Some(Box::new(WsResponder::new(
            &header.ws_key,
            &header.ws_version,
            channel_id,
            self.config.pkt_max_bytes,
            self.config.tx_queue_max,
            self.config.ping_ms,
            self.config.no_pong_ms,
            self.config.content == WsContent::Binary,
            Arc::clone(&self.inbound),
            Arc::clone(&self.channel_table),
            &self.log,
        )))
    }
}
