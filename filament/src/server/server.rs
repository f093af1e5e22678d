use crate::fs::FileSystem;
use crate::http::types::Method;
use crate::net::listener::Listener;
use crate::server::endpoint::{EndpointRegistry, RestEndpoint, SimpleEndpointRegistry};
use crate::server::handler::{InboundSink, RestApiHandler, SseHandler, StaticFileHandler, WsHandler};
use crate::server::manager::ConnManager;
use crate::settings::ServerSettings;
use lumen::logging::{self, info, warn, Logger};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Minimum stack for the listener thread; the configured task stack size is
/// honored when it asks for more.
const MIN_LISTENER_STACK_BYTES: usize = 64 * 1024;

/// SSE endpoints are served under this URI prefix.
const SSE_URI_PREFIX: &str = "/events";

/// Candidate web-server certificate set posted through `webcerts/set`. The
/// body may arrive in chunks; completion replies `{"rslt":"ok"}`.
pub struct WebCertsEndpoint {
    storage: Mutex<Vec<u8>>,
    log: Logger,
}

impl WebCertsEndpoint {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> WebCertsEndpoint {
        WebCertsEndpoint {
            storage: Mutex::new(Vec::new()),
            log: logging::child(log),
        }
    }

    /// The stored candidate certificate JSON, if any arrived.
    pub fn take_candidate(&self) -> Vec<u8> {
        self.storage
            .lock()
            .map(|mut storage| std::mem::replace(&mut *storage, Vec::new()))
            .unwrap_or_default()
    }
}

impl RestEndpoint for WebCertsEndpoint {
    fn complete(&self, req: &str) -> String {
        if let Ok(storage) = self.storage.lock() {
            if serde_json::from_slice::<serde_json::Value>(&storage).is_err() {
                warn!(self.log, "webcerts body is not valid JSON";
                      "req" => req, "len" => storage.len());
            } else {
                info!(self.log, "webcerts candidate stored";
                      "req" => req, "len" => storage.len());
            }
        }
        serde_json::json!({"rslt": "ok"}).to_string()
    }

    fn body(&self, _req: &str, data: &[u8], index: usize, _total: usize) {
        if let Ok(mut storage) = self.storage.lock() {
            if index == 0 {
                storage.clear();
            }
            storage.extend_from_slice(data);
        }
    }
}

/// The assembled server: a connection manager plus the listener thread.
/// Handlers are built from the settings; the filesystem, endpoint registry
/// and WebSocket message bus are supplied as boundary objects.
pub struct FilamentServer {
    manager: ConnManager,
    listener_started: bool,
    log: Logger,
}

impl FilamentServer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        settings: ServerSettings,
        endpoints: Arc<dyn EndpointRegistry>,
        fs: Arc<dyn FileSystem>,
        ws_inbound: Arc<dyn InboundSink>,
        log: L,
    ) -> FilamentServer {
        let log = logging::child(log);
        let mut manager = ConnManager::new(settings, &log);

        // REST endpoints are matched ahead of everything else
        let rest_prefix = manager.settings().rest_api_prefix.clone();
        manager.add_handler(
            Box::new(RestApiHandler::new(&rest_prefix, endpoints, &log)),
            true,
        );

        manager.add_handler(Box::new(SseHandler::new(SSE_URI_PREFIX, &log)), false);

        for ws_config in manager.settings().websockets.clone() {
            manager.add_handler(
                Box::new(WsHandler::new(ws_config, Arc::clone(&ws_inbound), &log)),
                false,
            );
        }

        if !manager.settings().static_file_paths.is_empty() {
            let handler =
                StaticFileHandler::new(manager.settings(), Arc::clone(&fs), None, &log);
            manager.add_handler(Box::new(handler), false);
        }

        FilamentServer {
            manager,
            listener_started: false,
            log,
        }
    }

    /// Registry pre-loaded with the server's own endpoints (`webcerts`).
    pub fn default_endpoints<'a, L: Into<Option<&'a Logger>>>(log: L) -> SimpleEndpointRegistry {
        let mut registry = SimpleEndpointRegistry::new();
        registry.add(
            "webcerts",
            Method::Post,
            Arc::new(WebCertsEndpoint::new(log.into())),
        );
        registry
    }

    /// Start the listener thread. Accepted connections flow through the
    /// bounded queue into the manager on subsequent service ticks.
    pub fn begin(&mut self) {
        if self.listener_started {
            return;
        }
        let port = self.manager.settings().server_tcp_port;
        let backlog = self.manager.settings().num_conn_slots;
        let stack_size = self
            .manager
            .settings()
            .task_stack_size
            .max(MIN_LISTENER_STACK_BYTES);
        let sender = self.manager.new_conn_sender();
        let log = self.log.clone();

        info!(self.log, "starting listener"; "port" => port);
        let spawn_result = thread::Builder::new()
            .name("filament-listen".to_string())
            .stack_size(stack_size)
            .spawn(move || {
                let listener = Listener::new(port, backlog, &log);
                listener.run(move |conn| sender.try_send(conn).is_ok());
            });
        match spawn_result {
            Ok(_handle) => self.listener_started = true,
            Err(err) => warn!(self.log, "failed to spawn listener"; "err" => %err),
        }
    }

    /// One tick of the service loop. Call frequently from the embedding
    /// application's main loop.
    pub fn service(&mut self, now: Instant) {
        self.manager.service(now);
    }

    /// Run the service loop on the current thread.
    pub fn run(&mut self) -> ! {
        self.begin();
        loop {
            self.service(Instant::now());
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn send_on_channel(&mut self, data: &[u8], channel_id: u32) -> bool {
        self.manager.send_on_channel(data, channel_id)
    }

    pub fn can_send_on_channel(&mut self, channel_id: u32) -> (bool, bool) {
        self.manager.can_send_on_channel(channel_id)
    }

    pub fn send_sse_event(&mut self, content: &str, group: &str) {
        self.manager.send_sse_event(content, group);
    }

    pub fn manager(&mut self) -> &mut ConnManager {
        &mut self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFileSystem;
    use crate::server::handler::InboundSink;
    use crate::test_support::mock_conn;

    struct NullSink;
    impl InboundSink for NullSink {
        fn handle(&self, _channel_id: u32, _data: &[u8]) {}
    }

    fn test_server(settings: ServerSettings) -> FilamentServer {
        let endpoints = Arc::new(FilamentServer::default_endpoints(None));
        let mut fs = MemFileSystem::new();
        fs.insert("/web/index.html", b"<h1>hi</h1>".to_vec());
        FilamentServer::new(settings, endpoints, Arc::new(fs), Arc::new(NullSink), None)
    }

    fn drive(server: &mut FilamentServer, ticks: usize) {
        let now = Instant::now();
        for _ in 0..ticks {
            server.service(now);
        }
    }

    #[test]
    fn test_webcerts_set_roundtrip() {
        let mut settings = ServerSettings::default();
        settings.static_file_paths = "/=/web".to_string();
        let mut server = test_server(settings);

        let (conn, state) = mock_conn(1);
        server.manager().new_conn_sender().try_send(conn).unwrap();
        drive(&mut server, 1);

        let body = b"{\"certs\":[\"pem\"]}";
        let mut request = format!(
            "POST /api/webcerts/set HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        state.lock().unwrap().rx.push_back(request);
        drive(&mut server, 3);

        let sent = String::from_utf8_lossy(&state.lock().unwrap().sent.clone()).into_owned();
        assert!(sent.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(sent.contains("Content-Type: text/json\r\n"));
        assert!(sent.ends_with("{\"rslt\":\"ok\"}"));
    }

    #[test]
    fn test_webcerts_chunked_body() {
        let endpoint = WebCertsEndpoint::new(None);
        endpoint.body("webcerts/set", b"{\"a\":", 0, 11);
        endpoint.body("webcerts/set", b"true}", 5, 11);
        assert_eq!(endpoint.complete("webcerts/set"), "{\"rslt\":\"ok\"}");
        assert_eq!(endpoint.take_candidate(), b"{\"a\":true}"[..].to_vec());
    }

    #[test]
    fn test_serves_static_site() {
        let mut settings = ServerSettings::default();
        settings.static_file_paths = "/=/web".to_string();
        let mut server = test_server(settings);

        let (conn, state) = mock_conn(2);
        server.manager().new_conn_sender().try_send(conn).unwrap();
        drive(&mut server, 1);
        state
            .lock()
            .unwrap()
            .rx
            .push_back(b"GET / HTTP/1.1\r\nHost: dev\r\n\r\n".to_vec());
        drive(&mut server, 2);

        let sent = String::from_utf8_lossy(&state.lock().unwrap().sent.clone()).into_owned();
        assert!(sent.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(sent.ends_with("<h1>hi</h1>"));
    }

    #[test]
    fn test_file_server_disabled_by_settings() {
        let mut settings = ServerSettings::default();
        settings.static_file_paths = "/=/web".to_string();
        settings.enable_file_server = false;
        let mut server = test_server(settings);

        let (conn, state) = mock_conn(3);
        server.manager().new_conn_sender().try_send(conn).unwrap();
        drive(&mut server, 1);
        state
            .lock()
            .unwrap()
            .rx
            .push_back(b"GET / HTTP/1.1\r\n\r\n".to_vec());
        drive(&mut server, 2);

        let sent = String::from_utf8_lossy(&state.lock().unwrap().sent.clone()).into_owned();
        assert!(sent.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_listener_accepts_real_socket() {
        let mut settings = ServerSettings::default();
        // Pick an ephemeral-range port unlikely to collide
        settings.server_tcp_port = 38473;
        settings.static_file_paths = "/=/web".to_string();
        let mut server = test_server(settings);
        server.begin();

        let mut connected = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            if std::net::TcpStream::connect(("127.0.0.1", 38473)).is_ok() {
                connected = true;
                break;
            }
        }
        assert!(connected);
        // The accepted connection lands in a slot on the next ticks
        let now = Instant::now();
        let mut placed = false;
        for _ in 0..50 {
            server.service(now);
            if server.manager().free_slot_count() < 10 {
                placed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(placed);
    }
}
