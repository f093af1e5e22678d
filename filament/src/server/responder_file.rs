use crate::fs::{FileChunker, FileSystem};
use crate::http::header::RequestHeader;
use crate::http::mime;
use crate::server::responder::Responder;
use hashbrown::HashMap;
use lumen::logging::{self, debug, warn, Logger};
use std::time::Instant;

/// Streams a file from the filesystem boundary. When the client accepts gzip
/// and `<path>.gz` exists, the pre-compressed variant is served with a
/// Content-Encoding header; the content type is always derived from the
/// uncompressed path.
pub struct FileResponder {
    chunker: Option<FileChunker>,
    content_type: String,
    extra_headers: Vec<(String, String)>,
    is_active: bool,
    file_path: String,
    log: Logger,
}

impl FileResponder {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        fs: &dyn FileSystem,
        file_path: &str,
        header: &RequestHeader,
        mime_overrides: &HashMap<String, String>,
        cache_control: Option<&str>,
        log: L,
    ) -> FileResponder {
        let log = logging::child(log);
        let mut extra_headers = Vec::new();

        // Try the pre-gzipped variant first when the client allows it
        let mut chunker = None;
        if header.accepts_gzip() {
            let gzip_path = format!("{}.gz", file_path);
            chunker = FileChunker::open(fs, &gzip_path);
            if chunker.is_some() {
                extra_headers.push(("Content-Encoding".to_string(), "gzip".to_string()));
                debug!(log, "serving gzip variant"; "path" => %gzip_path);
            }
        }
        if chunker.is_none() {
            chunker = FileChunker::open(fs, file_path);
        }
        if chunker.is_none() {
            warn!(log, "failed to open file"; "path" => file_path);
        }

        if let Some(cache_control) = cache_control {
            extra_headers.push(("Cache-Control".to_string(), cache_control.to_string()));
        }

        let is_active = chunker.is_some();
        FileResponder {
            chunker,
            content_type: mime::content_type_for(file_path, mime_overrides),
            extra_headers,
            is_active,
            file_path: file_path.to_string(),
            log,
        }
    }
}

impl Responder for FileResponder {
    fn start(&mut self, _now: Instant) -> bool {
        self.is_active
    }

    fn response_next(&mut self, max_len: usize, _now: Instant) -> Vec<u8> {
        if !self.is_active {
            return Vec::new();
        }
        let chunker = match self.chunker.as_mut() {
            Some(chunker) => chunker,
            None => return Vec::new(),
        };
        match chunker.next_chunk(max_len) {
            Ok((chunk, is_final)) => {
                if is_final {
                    self.is_active = false;
                }
                chunk
            }
            Err(err) => {
                warn!(self.log, "file read failed"; "path" => &self.file_path, "err" => %err);
                self.is_active = false;
                Vec::new()
            }
        }
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn content_length(&self) -> Option<usize> {
        self.chunker.as_ref().map(|chunker| chunker.len() as usize)
    }

    fn extra_headers(&self) -> &[(String, String)] {
        &self.extra_headers
    }

    fn responder_type(&self) -> &'static str {
        "file"
    }
}
