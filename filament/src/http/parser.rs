use crate::http::header::{RequestHeader, MAX_HEADER_PAIRS};
use crate::http::types::{ConnType, Method};

/// A malformed request line or header; the connection answers 400.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ParseError;

/// Streaming, line-oriented request header parser. Bytes are fed in as they
/// arrive; a partial line is buffered until its LF shows up. Parsing stops at
/// the blank line ending the header block, leaving any remaining bytes (the
/// body) unconsumed.
pub struct HeaderParser {
    line: String,
}

impl HeaderParser {
    pub fn new() -> HeaderParser {
        HeaderParser { line: String::new() }
    }

    pub fn clear(&mut self) {
        self.line.clear();
    }

    /// Feed received bytes into the header. Returns the number of bytes
    /// consumed; bytes past the end of the header block are left for the
    /// body. Header fields are frozen once `header.is_complete` is set.
    pub fn handle_data(
        &mut self,
        header: &mut RequestHeader,
        data: &[u8],
    ) -> Result<usize, ParseError> {
        let mut pos = 0;
        while pos < data.len() && !header.is_complete {
            let lf = data[pos..].iter().position(|&byte| byte == b'\n');
            match lf {
                Some(offset) => {
                    let segment = &data[pos..pos + offset];
                    self.line.push_str(&String::from_utf8_lossy(segment));
                    pos += offset + 1;
                    let line = std::mem::replace(&mut self.line, String::new());
                    self.dispatch_line(header, line.trim())?;
                }
                None => {
                    let segment = &data[pos..];
                    self.line.push_str(&String::from_utf8_lossy(segment));
                    pos = data.len();
                }
            }
        }
        Ok(pos)
    }

    fn dispatch_line(&mut self, header: &mut RequestHeader, line: &str) -> Result<(), ParseError> {
        if !header.got_first_line {
            if line.is_empty() {
                return Err(ParseError);
            }
            parse_request_line(header, line)?;
            header.got_first_line = true;
            return Ok(());
        }

        if line.is_empty() {
            header.is_complete = true;
            return Ok(());
        }

        parse_name_value_line(header, line);
        Ok(())
    }
}

impl Default for HeaderParser {
    fn default() -> HeaderParser {
        HeaderParser::new()
    }
}

fn parse_request_line(header: &mut RequestHeader, line: &str) -> Result<(), ParseError> {
    let method_end = line.find(' ').ok_or(ParseError)?;
    header.method = Method::from_token(&line[..method_end]);
    if header.method == Method::None {
        return Err(ParseError);
    }

    let rest = &line[method_end + 1..];
    let uri_end = rest.find(' ').ok_or(ParseError)?;
    header.uri_and_params = decode_url(&rest[..uri_end]);

    // Split out params if present
    match header.uri_and_params.find('?') {
        Some(qpos) if qpos > 0 => {
            header.url = header.uri_and_params[..qpos].to_string();
            header.params = header.uri_and_params[qpos + 1..].to_string();
        }
        _ => {
            header.url = header.uri_and_params.clone();
            header.params = String::new();
        }
    }

    header.version_str = rest[uri_end + 1..].to_string();
    Ok(())
}

fn parse_name_value_line(header: &mut RequestHeader, line: &str) {
    let colon = match line.find(':') {
        Some(pos) => pos,
        None => return,
    };
    let name = line[..colon].trim();
    let value = line[colon + 1..].trim_start();

    if header.name_values.len() >= MAX_HEADER_PAIRS {
        return;
    }
    header
        .name_values
        .push((name.to_string(), value.to_string()));

    if name.eq_ignore_ascii_case("Host") {
        header.host = value.to_string();
    } else if name.eq_ignore_ascii_case("Content-Type") {
        header.content_type = match value.find(';') {
            Some(semi) => value[..semi].to_string(),
            None => value.to_string(),
        };
        if value.starts_with("multipart/") {
            header.is_multipart = true;
            header.multipart_boundary = match value.find('=') {
                Some(eq) => value[eq + 1..].replace('"', ""),
                None => String::new(),
            };
        }
    } else if name.eq_ignore_ascii_case("Content-Length") {
        header.content_length = value.trim().parse().unwrap_or(0);
    } else if name.eq_ignore_ascii_case("Expect") && value.eq_ignore_ascii_case("100-continue") {
        header.is_continue = true;
    } else if name.eq_ignore_ascii_case("Authorization") {
        let bytes = value.as_bytes();
        if bytes.len() > 5 && bytes[..5].eq_ignore_ascii_case(b"Basic") {
            header.authorization =
                String::from_utf8_lossy(&bytes[6.min(bytes.len())..]).into_owned();
        } else if bytes.len() > 6 && bytes[..6].eq_ignore_ascii_case(b"Digest") {
            header.is_digest = true;
            header.authorization =
                String::from_utf8_lossy(&bytes[7.min(bytes.len())..]).into_owned();
        }
    } else if name.eq_ignore_ascii_case("Upgrade") && value.eq_ignore_ascii_case("websocket") {
        // WebSocket requests are uniquely identified by [Upgrade: websocket]
        header.conn_type = ConnType::WebSocket;
    } else if name.eq_ignore_ascii_case("Accept") {
        if value.to_ascii_lowercase().contains("text/event-stream") {
            header.conn_type = ConnType::Event;
        }
    } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
        header.ws_key = value.to_string();
    } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
        header.ws_version = value.to_string();
    }
}

/// Percent-decode a URL, mapping `+` to space. Escapes with non-hex digits
/// pass through unchanged.
pub fn decode_url(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let byte = bytes[pos];
        if byte == b'%' {
            let hi = bytes.get(pos + 1).and_then(|&b| hex_value(b));
            let lo = bytes.get(pos + 2).and_then(|&b| hex_value(b));
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(hi * 16 + lo);
                pos += 3;
                continue;
            }
        }
        out.push(if byte == b'+' { b' ' } else { byte });
        pos += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
