/// HTTP request methods accepted by the parser.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    None,
    Get,
    Post,
    Delete,
    Put,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        const METHODS: [(&str, Method); 7] = [
            ("GET", Method::Get),
            ("POST", Method::Post),
            ("DELETE", Method::Delete),
            ("PUT", Method::Put),
            ("PATCH", Method::Patch),
            ("HEAD", Method::Head),
            ("OPTIONS", Method::Options),
        ];
        for (name, method) in METHODS.iter() {
            if token.eq_ignore_ascii_case(name) {
                return *method;
            }
        }
        Method::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "NONE",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

/// Connection type inferred from the request headers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnType {
    Http,
    WebSocket,
    Event,
}

/// The subset of HTTP status codes the server emits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HttpStatus {
    Continue,
    SwitchingProtocols,
    Ok,
    NoContent,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    LengthRequired,
    PayloadTooLarge,
    UriTooLong,
    UnsupportedMediaType,
    NotImplemented,
    ServiceUnavailable,
}

impl HttpStatus {
    pub fn code(&self) -> u16 {
        match self {
            HttpStatus::Continue => 100,
            HttpStatus::SwitchingProtocols => 101,
            HttpStatus::Ok => 200,
            HttpStatus::NoContent => 204,
            HttpStatus::BadRequest => 400,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::MethodNotAllowed => 405,
            HttpStatus::RequestTimeout => 408,
            HttpStatus::LengthRequired => 411,
            HttpStatus::PayloadTooLarge => 413,
            HttpStatus::UriTooLong => 414,
            HttpStatus::UnsupportedMediaType => 415,
            HttpStatus::NotImplemented => 501,
            HttpStatus::ServiceUnavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HttpStatus::Continue => "Continue",
            HttpStatus::SwitchingProtocols => "Switching Protocols",
            HttpStatus::Ok => "OK",
            HttpStatus::NoContent => "No Content",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::MethodNotAllowed => "Method Not Allowed",
            HttpStatus::RequestTimeout => "Request Time-out",
            HttpStatus::LengthRequired => "Length Required",
            HttpStatus::PayloadTooLarge => "Request Entity Too Large",
            HttpStatus::UriTooLong => "Request-URI Too Large",
            HttpStatus::UnsupportedMediaType => "Unsupported Media Type",
            HttpStatus::NotImplemented => "Not Implemented",
            HttpStatus::ServiceUnavailable => "Service Unavailable",
        }
    }
}
