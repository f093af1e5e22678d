use crate::http::multipart::{FormInfo, MultipartError, MultipartParser, MultipartSink};
use crate::http::types::Method;
use crate::server::endpoint::{FileStreamBlock, RestEndpoint};
use crate::server::responder::{ConnTx, Responder};
use lumen::logging::{self, debug, Logger};
use std::sync::Arc;
use std::time::Instant;

/// Drives one REST API request. Body bytes are forwarded to the endpoint
/// (through the multipart parser for uploads); once exactly Content-Length
/// bytes have arrived the endpoint's completion runs a single time and its
/// response is streamed out in chunks.
pub struct RestApiResponder {
    endpoint: Arc<dyn RestEndpoint>,
    req_str: String,
    method: Method,
    content_length: usize,
    multipart: Option<MultipartParser>,
    is_active: bool,
    endpoint_called: bool,
    bytes_received: usize,
    response: Vec<u8>,
    response_pos: usize,
    log: Logger,
}

impl RestApiResponder {
    /// `req_str` is the URI with the REST prefix stripped, query included.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        endpoint: Arc<dyn RestEndpoint>,
        req_str: &str,
        method: Method,
        content_length: usize,
        multipart_boundary: Option<&str>,
        log: L,
    ) -> RestApiResponder {
        RestApiResponder {
            endpoint,
            req_str: req_str.to_string(),
            method,
            content_length,
            multipart: multipart_boundary.map(MultipartParser::new),
            is_active: false,
            endpoint_called: false,
            bytes_received: 0,
            response: Vec::new(),
            response_pos: 0,
            log: logging::child(log),
        }
    }

    fn call_endpoint_once(&mut self) {
        if self.endpoint_called {
            return;
        }
        self.response = self.endpoint.complete(&self.req_str).into_bytes();
        self.endpoint_called = true;
        debug!(self.log, "endpoint completed";
               "req" => %self.req_str, "resp_len" => self.response.len());
    }
}

/// Adapts multipart parser output onto the endpoint's `chunk` operation.
struct EndpointSink<'a> {
    endpoint: &'a dyn RestEndpoint,
    req_str: &'a str,
    content_length: usize,
}

impl<'a> MultipartSink for EndpointSink<'a> {
    fn on_data(
        &mut self,
        data: &[u8],
        form: &FormInfo,
        content_pos: usize,
        is_final_part: bool,
    ) -> Result<(), MultipartError> {
        let block = FileStreamBlock {
            filename: &form.filename,
            content_len: self.content_length,
            block_pos: content_pos,
            data,
            is_first_block: content_pos == 0,
            is_final_block: is_final_part,
            crc16: form.crc16,
            file_len_bytes: form.file_len_bytes,
        };
        if self.endpoint.chunk(self.req_str, &block) {
            Ok(())
        } else {
            Err(MultipartError::Sink)
        }
    }
}

impl Responder for RestApiResponder {
    fn start(&mut self, _now: Instant) -> bool {
        self.is_active = true;
        self.endpoint_called = false;
        self.bytes_received = 0;
        self.response_pos = 0;
        // Bodyless GETs complete immediately, which also makes the response
        // length available for the standard headers
        if self.method == Method::Get {
            self.call_endpoint_once();
        }
        true
    }

    fn handle_inbound(&mut self, data: &[u8], _now: Instant, _tx: &mut dyn ConnTx) -> bool {
        let index = self.bytes_received;
        self.bytes_received += data.len();

        match self.multipart.as_mut() {
            Some(parser) => {
                let mut sink = EndpointSink {
                    endpoint: self.endpoint.as_ref(),
                    req_str: &self.req_str,
                    content_length: self.content_length,
                };
                let _ = parser.handle_data(data, &mut sink);
            }
            None => {
                self.endpoint
                    .body(&self.req_str, data, index, self.content_length);
            }
        }
        true
    }

    fn response_next(&mut self, max_len: usize, _now: Instant) -> Vec<u8> {
        // Hold the response until the whole body has been observed
        if self.bytes_received != self.content_length {
            return Vec::new();
        }
        self.call_endpoint_once();

        let remaining = self.response.len() - self.response_pos;
        let take = remaining.min(max_len);
        let chunk = self.response[self.response_pos..self.response_pos + take].to_vec();
        self.response_pos += take;
        if self.response_pos >= self.response.len() {
            self.is_active = false;
        }
        chunk
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn ready_to_receive(&self) -> bool {
        self.endpoint.ready_to_receive()
    }

    fn content_type(&self) -> &str {
        "text/json"
    }

    fn content_length(&self) -> Option<usize> {
        // Only GET responses are sized up front (the endpoint has already
        // run by then); other methods stream without a length
        if self.method == Method::Get && self.endpoint_called {
            Some(self.response.len())
        } else {
            None
        }
    }

    fn responder_type(&self) -> &'static str {
        "api"
    }
}
