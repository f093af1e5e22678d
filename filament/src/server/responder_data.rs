use crate::server::responder::Responder;
use std::sync::Arc;
use std::time::Instant;

/// Serves a fixed in-memory blob with a given MIME type. Used for baked-in
/// static resources and the configurable 404 page.
pub struct DataResponder {
    data: Arc<Vec<u8>>,
    content_type: String,
    pos: usize,
    is_active: bool,
}

impl DataResponder {
    pub fn new(data: Arc<Vec<u8>>, content_type: &str) -> DataResponder {
        DataResponder {
            data,
            content_type: content_type.to_string(),
            pos: 0,
            is_active: true,
        }
    }
}

impl Responder for DataResponder {
    fn start(&mut self, _now: Instant) -> bool {
        self.pos = 0;
        self.is_active = true;
        true
    }

    fn response_next(&mut self, max_len: usize, _now: Instant) -> Vec<u8> {
        if !self.is_active {
            return Vec::new();
        }
        let remaining = self.data.len() - self.pos;
        let take = remaining.min(max_len);
        let chunk = self.data[self.pos..self.pos + take].to_vec();
        self.pos += take;
        if self.pos >= self.data.len() {
            self.is_active = false;
        }
        chunk
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn content_length(&self) -> Option<usize> {
        Some(self.data.len())
    }

    fn responder_type(&self) -> &'static str {
        "data"
    }
}
