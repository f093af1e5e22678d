use crate::http::types::Method;
use std::sync::Arc;

/// One block of a streamed multipart file upload, as delivered to an
/// endpoint's `chunk` operation.
#[derive(Debug)]
pub struct FileStreamBlock<'a> {
    pub filename: &'a str,
    /// Content-Length of the whole request body.
    pub content_len: usize,
    /// Byte offset of this block within the current part.
    pub block_pos: usize,
    pub data: &'a [u8],
    pub is_first_block: bool,
    pub is_final_block: bool,
    /// Optional CRC16 part header.
    pub crc16: Option<u16>,
    /// Optional FileLengthBytes part header.
    pub file_len_bytes: Option<u32>,
}

/// A REST endpoint. `complete` is required; body/chunk/readiness have
/// default no-op implementations for endpoints that do not stream data.
pub trait RestEndpoint: Send + Sync {
    /// Called exactly once, after the request body (if any) has been fully
    /// received. Returns the JSON response body.
    fn complete(&self, req: &str) -> String;

    /// A run of non-multipart body data; `index` is the byte offset within
    /// the body, `total` the declared content length.
    fn body(&self, _req: &str, _data: &[u8], _index: usize, _total: usize) {}

    /// One block of a multipart upload. Returning false aborts the upload.
    fn chunk(&self, _req: &str, _block: &FileStreamBlock) -> bool {
        true
    }

    /// Flow-control hint; false pauses body reception.
    fn ready_to_receive(&self) -> bool {
        true
    }
}

/// Boundary contract to the endpoint registry: resolve a prefix-stripped
/// request (e.g. "echo?verbose=1") and method to an endpoint.
pub trait EndpointRegistry: Send + Sync {
    fn lookup(&self, req: &str, method: Method) -> Option<Arc<dyn RestEndpoint>>;
}

/// Registry over a plain list; endpoints are matched on the first path
/// element of the request, so "webcerts/set" resolves the "webcerts"
/// endpoint with "set" as its argument.
#[derive(Default)]
pub struct SimpleEndpointRegistry {
    endpoints: Vec<(String, Method, Arc<dyn RestEndpoint>)>,
}

impl SimpleEndpointRegistry {
    pub fn new() -> SimpleEndpointRegistry {
        SimpleEndpointRegistry { endpoints: Vec::new() }
    }

    pub fn add(&mut self, name: &str, method: Method, endpoint: Arc<dyn RestEndpoint>) {
        self.endpoints.push((name.to_string(), method, endpoint));
    }
}

/// First path element of a request string, without a leading slash, query
/// string or trailing elements.
pub fn endpoint_name(req: &str) -> &str {
    let req = req.trim_start_matches('/');
    let end = req
        .find(|ch| ch == '/' || ch == '?')
        .unwrap_or_else(|| req.len());
    &req[..end]
}

impl EndpointRegistry for SimpleEndpointRegistry {
    fn lookup(&self, req: &str, method: Method) -> Option<Arc<dyn RestEndpoint>> {
        let name = endpoint_name(req);
        self.endpoints
            .iter()
            .find(|(stored, stored_method, _)| stored == name && *stored_method == method)
            .map(|(_, _, endpoint)| Arc::clone(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEndpoint;
    impl RestEndpoint for NullEndpoint {
        fn complete(&self, _req: &str) -> String {
            "{}".to_string()
        }
    }

    #[test]
    fn test_endpoint_name_extraction() {
        assert_eq!(endpoint_name("echo"), "echo");
        assert_eq!(endpoint_name("/echo"), "echo");
        assert_eq!(endpoint_name("echo?x=1"), "echo");
        assert_eq!(endpoint_name("webcerts/set"), "webcerts");
        assert_eq!(endpoint_name(""), "");
    }

    #[test]
    fn test_lookup_by_name_and_method() {
        let mut registry = SimpleEndpointRegistry::new();
        registry.add("echo", Method::Post, Arc::new(NullEndpoint));
        assert!(registry.lookup("echo", Method::Post).is_some());
        assert!(registry.lookup("/echo?x=1", Method::Post).is_some());
        assert!(registry.lookup("echo", Method::Get).is_none());
        assert!(registry.lookup("other", Method::Post).is_none());
    }

    #[test]
    fn test_lookup_with_path_argument() {
        let mut registry = SimpleEndpointRegistry::new();
        registry.add("webcerts", Method::Post, Arc::new(NullEndpoint));
        assert!(registry.lookup("webcerts/set", Method::Post).is_some());
    }
}
