//! Streaming parser for `multipart/form-data` bodies.
//!
//! Payload scanning uses a byte-presence map over the boundary string to skip
//! boundary-length runs of payload in one step (Boyer-Moore style), with a
//! lookback buffer so bytes consumed by a partial boundary match that fails
//! are re-emitted as payload. No payload byte is lost or delivered twice.

const ASCII_CR: u8 = 0x0d;
const ASCII_LF: u8 = 0x0a;
const ASCII_HYPHEN: u8 = b'-';
const ASCII_COLON: u8 = b':';
const ASCII_SPACE: u8 = b' ';

/// Parser failure modes. After any protocol violation the parser latches into
/// an error state and every further call reports `InvalidOperation`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MultipartError {
    Protocol,
    InvalidOperation,
    Sink,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseState {
    Start,
    StartBoundary,
    HeaderFieldStart,
    HeaderField,
    HeaderValueStart,
    HeaderValue,
    HeaderValueGot,
    HeadersAwaitFinalLf,
    PartData,
    End,
    Error,
}

/// Metadata gathered from the current part's headers.
#[derive(Debug, Clone, Default)]
pub struct FormInfo {
    pub filename: String,
    pub name: String,
    pub content_type: String,
    pub content_disp: String,
    pub crc16: Option<u16>,
    pub file_len_bytes: Option<u32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MultipartEvent {
    PartBegin,
    HeadersEnd,
}

/// Receiver for parse output. `on_data` may be called several times per part;
/// `content_pos` is the byte offset within the part of the run being
/// delivered and `is_final_part` is set once the terminating boundary has
/// been seen.
pub trait MultipartSink {
    fn on_event(&mut self, _event: MultipartEvent) {}
    fn on_header(&mut self, _name: &str, _value: &str) {}
    fn on_data(
        &mut self,
        _data: &[u8],
        _form: &FormInfo,
        _content_pos: usize,
        _is_final_part: bool,
    ) -> Result<(), MultipartError> {
        Ok(())
    }
}

pub struct MultipartParser {
    state: ParseState,
    /// "\r\n--" + boundary
    boundary: Vec<u8>,
    /// Bytes held back while a boundary match is in progress.
    boundary_buf: Vec<u8>,
    boundary_char_map: [bool; 256],
    boundary_idx: usize,
    content_pos: usize,
    is_final_part: bool,
    header_name: String,
    header_value: String,
    form: FormInfo,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> MultipartParser {
        let mut full = Vec::with_capacity(boundary.len() + 4);
        full.extend_from_slice(b"\r\n--");
        full.extend_from_slice(boundary.as_bytes());

        let mut char_map = [false; 256];
        for &byte in &full {
            char_map[byte as usize] = true;
        }

        let lookback = vec![0u8; full.len() + 8];
        MultipartParser {
            state: ParseState::Start,
            boundary: full,
            boundary_buf: lookback,
            boundary_char_map: char_map,
            boundary_idx: 0,
            content_pos: 0,
            is_final_part: false,
            header_name: String::new(),
            header_value: String::new(),
            form: FormInfo::default(),
        }
    }

    /// True once the final boundary has been consumed.
    pub fn succeeded(&self) -> bool {
        self.state == ParseState::End
    }

    pub fn has_error(&self) -> bool {
        self.state == ParseState::Error
    }

    /// Feed body bytes through the parser.
    pub fn handle_data(
        &mut self,
        data: &[u8],
        sink: &mut dyn MultipartSink,
    ) -> Result<(), MultipartError> {
        if self.state == ParseState::Error {
            return Err(MultipartError::InvalidOperation);
        }

        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                ParseState::PartData => {
                    pos = self.process_payload(data, pos, sink)?;
                }
                ParseState::End => break,
                ParseState::Error => return Err(MultipartError::Protocol),
                _ => {
                    let keep_going = self.process_header_byte(data[pos], sink);
                    pos += 1;
                    if !keep_going && self.state != ParseState::PartData {
                        self.state = ParseState::Error;
                        return Err(MultipartError::Protocol);
                    }
                }
            }
        }
        Ok(())
    }

    /// Consume one byte of the pre-payload sections (start boundary and part
    /// headers). Returns false when the header loop must stop, either because
    /// payload parsing starts or because of a protocol error (caller
    /// distinguishes by state).
    fn process_header_byte(&mut self, cur: u8, sink: &mut dyn MultipartSink) -> bool {
        match self.state {
            ParseState::Start => {
                self.boundary_idx = 0;
                self.state = ParseState::StartBoundary;
                self.start_boundary_byte(cur, sink)
            }
            ParseState::StartBoundary => self.start_boundary_byte(cur, sink),
            ParseState::HeaderFieldStart => {
                self.state = ParseState::HeaderField;
                self.header_name.clear();
                self.header_field_byte(cur)
            }
            ParseState::HeaderField => self.header_field_byte(cur),
            ParseState::HeaderValueStart => {
                if cur == ASCII_SPACE {
                    return true;
                }
                self.state = ParseState::HeaderValue;
                self.header_value.clear();
                self.header_value_byte(cur, sink)
            }
            ParseState::HeaderValue => self.header_value_byte(cur, sink),
            ParseState::HeaderValueGot => {
                if cur != ASCII_LF {
                    return false;
                }
                self.state = ParseState::HeaderFieldStart;
                true
            }
            ParseState::HeadersAwaitFinalLf => {
                if cur != ASCII_LF {
                    return false;
                }
                sink.on_event(MultipartEvent::HeadersEnd);
                self.state = ParseState::PartData;
                self.content_pos = 0;
                self.boundary_idx = 0;
                self.is_final_part = false;
                false
            }
            _ => true,
        }
    }

    /// Match the leading `--boundary\r\n` (no CRLF prefix at stream start).
    fn start_boundary_byte(&mut self, cur: u8, sink: &mut dyn MultipartSink) -> bool {
        if self.boundary_idx == self.boundary.len() - 2 {
            if cur != ASCII_CR {
                return false;
            }
            self.boundary_idx += 1;
        } else if self.boundary_idx == self.boundary.len() - 1 {
            if cur != ASCII_LF {
                return false;
            }
            self.boundary_idx = 0;
            self.form = FormInfo::default();
            sink.on_event(MultipartEvent::PartBegin);
            self.state = ParseState::HeaderFieldStart;
        } else {
            if cur != self.boundary[self.boundary_idx + 2] {
                return false;
            }
            self.boundary_idx += 1;
        }
        true
    }

    fn header_field_byte(&mut self, cur: u8) -> bool {
        if cur == ASCII_CR {
            // Empty line: end of this part's headers
            self.header_name.clear();
            self.state = ParseState::HeadersAwaitFinalLf;
            return true;
        }
        if cur == ASCII_COLON {
            if self.header_name.is_empty() {
                return false;
            }
            self.state = ParseState::HeaderValueStart;
            return true;
        }
        if !is_valid_tchar(cur) {
            return false;
        }
        self.header_name.push(cur as char);
        true
    }

    fn header_value_byte(&mut self, cur: u8, sink: &mut dyn MultipartSink) -> bool {
        if cur == ASCII_CR {
            if !self.header_name.is_empty() && !self.header_value.is_empty() {
                let name = std::mem::replace(&mut self.header_name, String::new());
                let value = std::mem::replace(&mut self.header_value, String::new());
                self.header_value_found(&name, &value, sink);
            }
            self.state = ParseState::HeaderValueGot;
            return true;
        }
        self.header_value.push(cur as char);
        true
    }

    fn header_value_found(&mut self, name: &str, value: &str, sink: &mut dyn MultipartSink) {
        if name.eq_ignore_ascii_case("Content-Disposition") {
            if let Some(semi) = value.find(';') {
                self.form.content_disp = value[..semi].to_string();
            }
            for attr in value.split(';') {
                let attr = attr.trim();
                if let Some(eq) = attr.find('=') {
                    let key = attr[..eq].trim();
                    let val = attr[eq + 1..].trim().replace('"', "");
                    if key.eq_ignore_ascii_case("filename") {
                        self.form.filename = val;
                    } else if key.eq_ignore_ascii_case("name") {
                        self.form.name = val;
                    }
                }
            }
        } else if name.eq_ignore_ascii_case("Content-Type") {
            self.form.content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("FileLengthBytes") {
            self.form.file_len_bytes = Some(parse_uint_auto(value) as u32);
        } else if name.eq_ignore_ascii_case("CRC16") {
            self.form.crc16 = Some(parse_uint_auto(value) as u16);
        }
        sink.on_header(name, value);
    }

    /// Scan payload bytes for the boundary, delivering payload runs as they
    /// are confirmed not to be part of a boundary. Returns the position where
    /// scanning stopped (end of buffer, or just past a completed boundary).
    fn process_payload(
        &mut self,
        data: &[u8],
        start: usize,
        sink: &mut dyn MultipartSink,
    ) -> Result<usize, MultipartError> {
        let blen = self.boundary.len();
        let mut payload_start = start;
        let mut pos = start;

        while pos < data.len() {
            if self.boundary_idx == 0 {
                // Fast skip: the byte a boundary-length ahead must be a
                // boundary char for a boundary to end there
                while pos + blen < data.len() {
                    if self.boundary_char_map[data[pos + blen - 1] as usize] {
                        break;
                    }
                    pos += blen;
                }
            }

            let cur = data[pos];
            if self.boundary_idx != 0 {
                if self.boundary_idx < self.boundary_buf.len() {
                    self.boundary_buf[self.boundary_idx] = cur;
                }

                if (self.boundary_idx == blen || self.boundary_idx == blen + 1)
                    && cur == ASCII_HYPHEN
                {
                    // Trailing hyphens mark the final boundary
                    if self.boundary_idx == blen + 1 {
                        self.is_final_part = true;
                    }
                    self.boundary_idx += 1;
                } else if (self.boundary_idx == blen
                    || (self.is_final_part && self.boundary_idx == blen + 2))
                    && cur == ASCII_CR
                {
                    self.boundary_idx += 1;
                } else if (self.boundary_idx == blen + 1
                    || (self.is_final_part && self.boundary_idx == blen + 3))
                    && cur == ASCII_LF
                {
                    // Complete boundary: deliver the payload preceding it.
                    // A zero-length run still fires so the sink observes the
                    // final-part flag even when the data was already flushed.
                    let data_len = (pos as isize - payload_start as isize
                        - self.boundary_idx as isize)
                        .max(0) as usize;
                    self.emit_data(&data[payload_start..payload_start + data_len], sink)?;
                    self.boundary_idx = 0;
                    self.content_pos = 0;
                    if self.is_final_part {
                        self.state = ParseState::End;
                        return Ok(pos + 1);
                    }
                    // Next part's headers follow
                    self.form = FormInfo::default();
                    sink.on_event(MultipartEvent::PartBegin);
                    self.state = ParseState::HeaderFieldStart;
                    return Ok(pos + 1);
                } else if self.boundary_idx < blen && cur == self.boundary[self.boundary_idx] {
                    self.boundary_idx += 1;
                } else {
                    // Not a boundary after all
                    if payload_start + self.boundary_idx > pos {
                        // The candidate started in an earlier chunk; its bytes
                        // are only in the lookback buffer, so re-emit them
                        let held: Vec<u8> = self.boundary_buf[..self.boundary_idx].to_vec();
                        self.emit_data(&held, sink)?;
                        payload_start = pos;
                    }
                    self.boundary_idx = 0;
                }
            }

            if self.boundary_idx == 0 && cur == self.boundary[0] {
                // Possible start of a boundary
                self.boundary_buf[0] = cur;
                self.boundary_idx = 1;
            }

            pos += 1;

            if pos == data.len() {
                // Flush payload that cannot be part of the pending boundary
                if data.len() > payload_start + self.boundary_idx {
                    let end = data.len() - self.boundary_idx;
                    self.emit_data(&data[payload_start..end], sink)?;
                }
            }
        }
        Ok(pos)
    }

    fn emit_data(
        &mut self,
        bytes: &[u8],
        sink: &mut dyn MultipartSink,
    ) -> Result<(), MultipartError> {
        sink.on_data(bytes, &self.form, self.content_pos, self.is_final_part)?;
        self.content_pos += bytes.len();
        Ok(())
    }
}

/// Decimal, or hex with an 0x prefix.
fn parse_uint_auto(value: &str) -> u64 {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        value.parse().unwrap_or(0)
    }
}

fn is_valid_tchar(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        runs: Vec<(String, Vec<u8>, usize, bool)>,
        headers: Vec<(String, String)>,
        part_begins: usize,
        crc16: Option<u16>,
        file_len: Option<u32>,
    }

    impl MultipartSink for RecordingSink {
        fn on_event(&mut self, event: MultipartEvent) {
            if event == MultipartEvent::PartBegin {
                self.part_begins += 1;
            }
        }

        fn on_header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }

        fn on_data(
            &mut self,
            data: &[u8],
            form: &FormInfo,
            content_pos: usize,
            is_final_part: bool,
        ) -> Result<(), MultipartError> {
            self.crc16 = form.crc16;
            self.file_len = form.file_len_bytes;
            self.runs
                .push((form.filename.clone(), data.to_vec(), content_pos, is_final_part));
            Ok(())
        }
    }

    fn two_part_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\r\n",
        );
        body.extend_from_slice(&[0x01, 0x02, 0x03]);
        body.extend_from_slice(b"\r\n--xyz\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"b.bin\"\r\n\r\n",
        );
        body.extend_from_slice(&[0x04, 0x05]);
        body.extend_from_slice(b"\r\n--xyz--\r\n");
        body
    }

    fn collect_parts(sink: &RecordingSink) -> Vec<(String, Vec<u8>, bool)> {
        // Aggregate runs by filename in arrival order
        let mut parts: Vec<(String, Vec<u8>, bool)> = Vec::new();
        for (filename, data, _pos, is_final) in &sink.runs {
            match parts.last_mut() {
                Some((name, bytes, final_flag)) if name == filename => {
                    bytes.extend_from_slice(data);
                    *final_flag = *is_final;
                }
                _ => parts.push((filename.clone(), data.clone(), *is_final)),
            }
        }
        parts
    }

    #[test]
    fn test_two_part_upload() {
        let mut parser = MultipartParser::new("xyz");
        let mut sink = RecordingSink::default();
        parser.handle_data(&two_part_body(), &mut sink).unwrap();

        assert!(parser.succeeded());
        assert_eq!(sink.part_begins, 2);
        let parts = collect_parts(&sink);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ("a.bin".to_string(), vec![1, 2, 3], false));
        assert_eq!(parts[1], ("b.bin".to_string(), vec![4, 5], true));
        // First run of each part starts at offset zero
        assert_eq!(sink.runs[0].2, 0);
    }

    #[test]
    fn test_single_byte_feed_preserves_payload() {
        let body = two_part_body();
        let mut parser = MultipartParser::new("xyz");
        let mut sink = RecordingSink::default();
        for byte in &body {
            parser.handle_data(std::slice::from_ref(byte), &mut sink).unwrap();
        }
        assert!(parser.succeeded());
        let parts = collect_parts(&sink);
        assert_eq!(parts[0].1, vec![1, 2, 3]);
        assert_eq!(parts[1].1, vec![4, 5]);
        assert!(parts[1].2);
    }

    #[test]
    fn test_near_boundary_payload_not_lost() {
        // Payload contains a near-boundary that diverges on the last char
        let payload = b"AB\r\n--xyQCD".to_vec();
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"f\"; filename=\"n.bin\"\r\n\r\n");
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--xyz--\r\n");

        for chunk_size in [1usize, 3, 5, body.len()].iter() {
            let mut parser = MultipartParser::new("xyz");
            let mut sink = RecordingSink::default();
            for chunk in body.chunks(*chunk_size) {
                parser.handle_data(chunk, &mut sink).unwrap();
            }
            assert!(parser.succeeded(), "chunk size {}", chunk_size);
            let total: Vec<u8> = sink
                .runs
                .iter()
                .flat_map(|(_, data, _, _)| data.clone())
                .collect();
            assert_eq!(total, payload, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_custom_part_headers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"fw\"; filename=\"fw.bin\"\r\n");
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(b"FileLengthBytes: 4\r\n");
        body.extend_from_slice(b"CRC16: 0xBEEF\r\n\r\n");
        body.extend_from_slice(&[9, 9, 9, 9]);
        body.extend_from_slice(b"\r\n--bnd--\r\n");

        let mut parser = MultipartParser::new("bnd");
        let mut sink = RecordingSink::default();
        parser.handle_data(&body, &mut sink).unwrap();

        assert_eq!(sink.crc16, Some(0xbeef));
        assert_eq!(sink.file_len, Some(4));
        assert!(sink
            .headers
            .iter()
            .any(|(name, value)| name == "Content-Type" && value == "application/octet-stream"));
        let parts = collect_parts(&sink);
        assert_eq!(parts[0].1, vec![9, 9, 9, 9]);
    }

    #[test]
    fn test_content_pos_monotone_within_part() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; filename=\"big\"\r\n\r\n");
        let payload: Vec<u8> = (0..200u8).collect();
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--b--\r\n");

        let mut parser = MultipartParser::new("b");
        let mut sink = RecordingSink::default();
        for chunk in body.chunks(16) {
            parser.handle_data(chunk, &mut sink).unwrap();
        }
        let mut expected_pos = 0;
        let mut total = Vec::new();
        for (_, data, pos, _) in &sink.runs {
            assert_eq!(*pos, expected_pos);
            expected_pos += data.len();
            total.extend_from_slice(data);
        }
        assert_eq!(total, payload);
    }

    #[test]
    fn test_bad_start_boundary_latches_error() {
        let mut parser = MultipartParser::new("xyz");
        let mut sink = RecordingSink::default();
        let result = parser.handle_data(b"--wrong\r\n", &mut sink);
        assert_eq!(result, Err(MultipartError::Protocol));
        assert!(parser.has_error());
        let result = parser.handle_data(b"more", &mut sink);
        assert_eq!(result, Err(MultipartError::InvalidOperation));
    }

    #[test]
    fn test_parse_uint_auto() {
        assert_eq!(parse_uint_auto("1234"), 1234);
        assert_eq!(parse_uint_auto("0x10"), 16);
        assert_eq!(parse_uint_auto(" 7 "), 7);
        assert_eq!(parse_uint_auto("junk"), 0);
    }
}
