use std::io;

/// Result of a send attempt on a connection or channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Ok,
    EAgain,
    Fail,
    TooLong,
    FrameError,
    NoConnection,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Ok => "Ok",
            SendOutcome::EAgain => "EAGAIN",
            SendOutcome::Fail => "Fail",
            SendOutcome::TooLong => "TooLong",
            SendOutcome::FrameError => "FrameError",
            SendOutcome::NoConnection => "NoConn",
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        *self == SendOutcome::Ok
    }
}

/// Surface for components that put bytes on a connection's wire (directly or
/// via its transmit queue). Implemented by the connection slot and by mocks
/// in tests.
pub trait ConnTx {
    fn raw_send(&mut self, buf: &[u8], max_retry_ms: u64) -> SendOutcome;

    /// Writability probe. The slot implementation reports EAgain on queue
    /// pressure before consulting the socket.
    fn can_send(&mut self) -> SendOutcome {
        SendOutcome::Ok
    }
}

/// Result of a non-blocking receive.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvOutcome {
    Ok,
    ConnClosed,
    Error,
}

/// Errors that mean the socket is dead and must be closed immediately,
/// as opposed to transient conditions worth retrying.
#[inline]
pub fn is_fatal_send_errno(errno: i32) -> bool {
    errno == libc::ECONNRESET
        || errno == libc::EPIPE
        || errno == libc::ENOTCONN
        || errno == libc::ECONNABORTED
        || errno == libc::ENETDOWN
        || errno == libc::ENETRESET
}

#[inline]
pub fn is_fatal_recv_errno(errno: i32) -> bool {
    errno == libc::ECONNRESET
        || errno == libc::EPIPE
        || errno == libc::ENOTCONN
        || errno == libc::ECONNABORTED
}

#[inline]
pub fn is_again_errno(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINPROGRESS
}

#[inline]
pub fn io_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// WouldBlock either via errno or via the error kind (mock streams in tests
/// report the kind only).
#[inline]
pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || is_again_errno(io_errno(err))
}
