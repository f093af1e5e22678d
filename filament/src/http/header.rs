use crate::http::types::{ConnType, Method};

/// At most this many name/value pairs are stored per request; the rest are
/// silently dropped.
pub const MAX_HEADER_PAIRS: usize = 20;

/// Parsed request header. Fields are populated incrementally by the parser
/// and must be treated as frozen once `is_complete` is true.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// Percent-decoded URI including any query string.
    pub uri_and_params: String,
    /// URI up to the `?`.
    pub url: String,
    /// Query string after the `?` (empty if none).
    pub params: String,
    pub version_str: String,
    pub method: Method,
    pub name_values: Vec<(String, String)>,

    // Extracted well-known headers
    pub host: String,
    pub content_type: String,
    pub content_length: usize,
    pub authorization: String,
    pub is_digest: bool,
    pub is_multipart: bool,
    pub multipart_boundary: String,
    pub conn_type: ConnType,
    pub is_continue: bool,
    pub ws_key: String,
    pub ws_version: String,

    pub got_first_line: bool,
    pub is_complete: bool,
}

impl RequestHeader {
    pub fn new() -> RequestHeader {
        RequestHeader {
            uri_and_params: String::new(),
            url: String::new(),
            params: String::new(),
            version_str: String::new(),
            method: Method::None,
            name_values: Vec::new(),
            host: String::new(),
            content_type: String::new(),
            content_length: 0,
            authorization: String::new(),
            is_digest: false,
            is_multipart: false,
            multipart_boundary: String::new(),
            conn_type: ConnType::Http,
            is_continue: false,
            ws_key: String::new(),
            ws_version: String::new(),
            got_first_line: false,
            is_complete: false,
        }
    }

    pub fn clear(&mut self) {
        *self = RequestHeader::new();
    }

    /// Value of a stored header, matched case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.name_values
            .iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// True if the client advertised gzip support.
    pub fn accepts_gzip(&self) -> bool {
        self.header_value("Accept-Encoding")
            .map(|value| value.contains("gzip"))
            .unwrap_or(false)
    }
}

impl Default for RequestHeader {
    fn default() -> RequestHeader {
        RequestHeader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_lookup() {
        let mut header = RequestHeader::new();
        header
            .name_values
            .push(("Accept-Encoding".to_string(), "gzip, deflate".to_string()));
        assert_eq!(header.header_value("accept-encoding"), Some("gzip, deflate"));
        assert_eq!(header.header_value("Host"), None);
        assert!(header.accepts_gzip());
    }

    #[test]
    fn test_clear_resets_completion() {
        let mut header = RequestHeader::new();
        header.is_complete = true;
        header.content_length = 55;
        header.clear();
        assert!(!header.is_complete);
        assert_eq!(header.content_length, 0);
        assert_eq!(header.conn_type, ConnType::Http);
    }
}
