use serde::Deserialize;

/// Content framing for a WebSocket endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsContent {
    Text,
    Binary,
}

impl Default for WsContent {
    fn default() -> WsContent {
        WsContent::Binary
    }
}

/// Configuration for one WebSocket handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsEndpointSettings {
    /// URI prefix the handler matches, e.g. "/ws".
    pub prefix: String,
    /// Protocol tag reported to external consumers of the channel.
    pub protocol: String,
    /// Maximum simultaneous connections (= channel ids reserved).
    pub max_conn: usize,
    /// Largest application packet accepted for sending.
    pub pkt_max_bytes: usize,
    /// Outbound frame queue depth.
    pub tx_queue_max: usize,
    /// Ping interval, 0 disables pings.
    pub ping_ms: u64,
    /// Disconnect when no pong seen for this long (after the first pong).
    pub no_pong_ms: u64,
    pub content: WsContent,
    /// First channel id for this handler; ids are allocated sequentially.
    pub channel_id_base: u32,
}

impl Default for WsEndpointSettings {
    fn default() -> WsEndpointSettings {
        WsEndpointSettings {
            prefix: "/ws".to_string(),
            protocol: String::new(),
            max_conn: 2,
            pkt_max_bytes: 1000,
            tx_queue_max: 10,
            ping_ms: 2000,
            no_pong_ms: 5000,
            content: WsContent::Binary,
            channel_id_base: 1,
        }
    }
}

/// Server configuration. All fields have defaults so settings can be loaded
/// from partial JSON or built literally.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub server_tcp_port: u16,
    pub num_conn_slots: usize,
    pub enable_websockets: bool,
    pub enable_file_server: bool,
    /// Scheduling hints for the listener/service threads. Core pinning is
    /// advisory on hosted targets; stack size is applied where possible.
    pub task_core: u32,
    pub task_priority: u32,
    pub task_stack_size: usize,
    /// Per-connection transmit queue cap and maximum response chunk size.
    pub send_buffer_max_len: usize,
    /// Channel id reported for REST-sourced messages.
    pub rest_api_channel_id: u32,
    /// Headers appended to every response, e.g. "Access-Control-Allow-Origin: *".
    pub std_response_headers: Vec<String>,
    /// URI prefix under which REST endpoints are matched.
    pub rest_api_prefix: String,
    pub websockets: Vec<WsEndpointSettings>,
    /// Comma-separated `uri=fs_path` pairs for the static file handler.
    pub static_file_paths: String,
    /// Comma-separated `ext=mime` overrides for content-type inference.
    pub mime_types: String,
    /// Body served with status 404 when no handler matches.
    pub page_404_source: String,
    /// Grace period after a response completes before the slot is reusable.
    pub clear_pending_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> ServerSettings {
        ServerSettings {
            server_tcp_port: 80,
            num_conn_slots: 10,
            enable_websockets: true,
            enable_file_server: true,
            task_core: 0,
            task_priority: 9,
            task_stack_size: 5000,
            send_buffer_max_len: 5000,
            rest_api_channel_id: u32::max_value(),
            std_response_headers: Vec::new(),
            rest_api_prefix: "/api".to_string(),
            websockets: Vec::new(),
            static_file_paths: String::new(),
            mime_types: String::new(),
            page_404_source: String::new(),
            clear_pending_ms: 0,
        }
    }
}

impl ServerSettings {
    /// Parse `static_file_paths` into (uri, fs_path) pairs. Entries without a
    /// `=` serve the path at the root URI. URIs get a leading slash and lose
    /// any trailing one.
    pub fn serve_path_pairs(&self) -> Vec<(String, String)> {
        parse_pair_list(&self.static_file_paths, "/")
    }

    /// Parse `mime_types` into (extension, mime) override pairs.
    pub fn mime_type_pairs(&self) -> Vec<(String, String)> {
        self.mime_types
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                let eq = entry.find('=')?;
                Some((entry[..eq].to_string(), entry[eq + 1..].to_string()))
            })
            .collect()
    }

    /// The standard response headers as a preformatted CRLF-terminated block.
    pub fn std_headers_block(&self) -> String {
        let mut block = String::new();
        for header in &self.std_response_headers {
            block.push_str(header);
            block.push_str("\r\n");
        }
        block
    }
}

fn parse_pair_list(list: &str, default_key: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (uri, path) = match entry.find('=') {
            Some(eq) => (entry[..eq].to_string(), entry[eq + 1..].to_string()),
            None => (default_key.to_string(), entry.to_string()),
        };
        let mut uri = if uri.starts_with('/') { uri } else { format!("/{}", uri) };
        if uri.len() > 1 && uri.ends_with('/') {
            uri.pop();
        }
        let mut path = path;
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        pairs.push((uri, path));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.server_tcp_port, 80);
        assert_eq!(settings.num_conn_slots, 10);
        assert_eq!(settings.send_buffer_max_len, 5000);
        assert_eq!(settings.rest_api_prefix, "/api");
        assert!(settings.enable_file_server);
    }

    #[test]
    fn test_from_json_partial() {
        let settings: ServerSettings = serde_json::from_str(
            r#"{
                "server_tcp_port": 8080,
                "websockets": [{"prefix": "/ws", "max_conn": 4, "channel_id_base": 20}],
                "static_file_paths": "/=/spiffs,/files=/sd/files"
            }"#,
        )
        .unwrap();
        assert_eq!(settings.server_tcp_port, 8080);
        assert_eq!(settings.num_conn_slots, 10);
        assert_eq!(settings.websockets.len(), 1);
        assert_eq!(settings.websockets[0].max_conn, 4);
        assert_eq!(settings.websockets[0].pkt_max_bytes, 1000);
        assert_eq!(settings.websockets[0].ping_ms, 2000);
        let pairs = settings.serve_path_pairs();
        assert_eq!(pairs[0], ("/".to_string(), "/spiffs".to_string()));
        assert_eq!(pairs[1], ("/files".to_string(), "/sd/files".to_string()));
    }

    #[test]
    fn test_serve_paths_without_uri() {
        let mut settings = ServerSettings::default();
        settings.static_file_paths = "/spiffs".to_string();
        let pairs = settings.serve_path_pairs();
        assert_eq!(pairs, vec![("/".to_string(), "/spiffs".to_string())]);
    }

    #[test]
    fn test_mime_overrides() {
        let mut settings = ServerSettings::default();
        settings.mime_types = "foo=application/x-foo,bar=text/bar".to_string();
        let pairs = settings.mime_type_pairs();
        assert_eq!(pairs[0], ("foo".to_string(), "application/x-foo".to_string()));
        assert_eq!(pairs[1], ("bar".to_string(), "text/bar".to_string()));
    }

    #[test]
    fn test_std_headers_block() {
        let mut settings = ServerSettings::default();
        settings.std_response_headers = vec!["Access-Control-Allow-Origin: *".to_string()];
        assert_eq!(settings.std_headers_block(), "Access-Control-Allow-Origin: *\r\n");
    }
}
