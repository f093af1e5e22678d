use crate::net::defs::{
    is_fatal_recv_errno, is_fatal_send_errno, is_would_block, io_errno, RecvOutcome, SendOutcome,
};
use lumen::logging::{self, debug, warn, Logger};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use socket2::SockRef;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

/// Stable identifier assigned to each accepted connection.
pub type ClientId = u64;

/// Largest single non-blocking receive, sized to a TCP MSS.
pub const RX_BUFFER_MAX_BYTES: usize = 1440;

const WRITE_PROBE_TOKEN: Token = Token(0);

/// One accepted client socket. The concrete transport lives behind this trait
/// so the slot machinery can be driven by mock connections in tests and by
/// alternative transports (e.g. a TLS wrapper) in deployments.
pub trait ClientConn: Send {
    fn client_id(&self) -> ClientId;

    /// False once the socket has been shut down after a fatal error or close.
    fn is_active(&self) -> bool;

    /// Apply socket options; non-blocking unless `blocking` is set.
    fn setup(&mut self, blocking: bool);

    /// Attempt a send. On EAGAIN the attempt is retried with 1 ms yields
    /// until `max_retry_ms` elapses; zero means a single attempt. Returns the
    /// outcome and the number of bytes actually written (which may be short).
    fn send(&mut self, buf: &[u8], max_retry_ms: u64) -> (SendOutcome, usize);

    /// Non-blocking writability probe.
    fn can_send(&mut self) -> SendOutcome;

    /// Non-blocking receive into `out_buf`. Empty output with `Ok` means no
    /// data was pending.
    fn recv_start(&mut self, out_buf: &mut Vec<u8>) -> RecvOutcome;

    /// Release any transient receive state.
    fn recv_end(&mut self);
}

/// `ClientConn` over a BSD socket (mio non-blocking TCP stream).
pub struct SocketClient {
    stream: Option<TcpStream>,
    id: ClientId,
    poll: Option<Poll>,
    events: Events,
    probe_registered: bool,
    bytes_read: u64,
    bytes_written: u64,
    opened_at: Instant,
    last_access_at: Instant,
    log: Logger,
}

impl SocketClient {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(stream: TcpStream, id: ClientId, log: L) -> SocketClient {
        let log = logging::child(log);
        debug!(log, "client conn created"; "conn_id" => id);
        SocketClient {
            stream: Some(stream),
            id,
            poll: None,
            events: Events::with_capacity(2),
            probe_registered: false,
            bytes_read: 0,
            bytes_written: 0,
            opened_at: Instant::now(),
            last_access_at: Instant::now(),
            log,
        }
    }

    /// Time of the last successful transfer in either direction.
    pub fn last_access_at(&self) -> Instant {
        self.last_access_at
    }

    /// Shut the socket down and drop it; the connection reports `Fail` /
    /// `ConnClosed` from here on.
    fn close_socket(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.probe_registered = false;
    }

    fn probe_writable(&mut self) -> SendOutcome {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return SendOutcome::Fail,
        };
        if self.poll.is_none() {
            match Poll::new() {
                Ok(poll) => self.poll = Some(poll),
                Err(_) => return SendOutcome::Fail,
            }
        }
        let poll = match self.poll.as_mut() {
            Some(poll) => poll,
            None => return SendOutcome::Fail,
        };
        let registry = poll.registry();
        let reg_result = if self.probe_registered {
            registry.reregister(stream, WRITE_PROBE_TOKEN, Interest::WRITABLE)
        } else {
            registry.register(stream, WRITE_PROBE_TOKEN, Interest::WRITABLE)
        };
        if reg_result.is_err() {
            return SendOutcome::Fail;
        }
        self.probe_registered = true;
        if poll.poll(&mut self.events, Some(Duration::from_millis(0))).is_err() {
            return SendOutcome::Fail;
        }
        for event in self.events.iter() {
            if event.is_writable() {
                return SendOutcome::Ok;
            }
        }
        SendOutcome::EAgain
    }
}

impl ClientConn for SocketClient {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    fn setup(&mut self, blocking: bool) {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return,
        };
        let sock = SockRef::from(stream);
        // Linger briefly so final response bytes survive the close
        let _ = sock.set_linger(Some(Duration::from_secs(2)));
        let _ = sock.set_reuse_address(true);
        let _ = sock.set_nodelay(true);
        let fd = sock.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags >= 0 {
            let _ = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        }
        let _ = sock.set_nonblocking(!blocking);
    }

    fn send(&mut self, buf: &[u8], max_retry_ms: u64) -> (SendOutcome, usize) {
        if self.stream.is_none() {
            warn!(self.log, "send on inactive conn"; "conn_id" => self.id);
            return (SendOutcome::Fail, 0);
        }
        let started = Instant::now();
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return (SendOutcome::Fail, 0),
            };
            match stream.write(buf) {
                Ok(written) => {
                    self.bytes_written += written as u64;
                    self.last_access_at = Instant::now();
                    return (SendOutcome::Ok, written);
                }
                Err(ref err) if is_would_block(err) => {
                    if max_retry_ms == 0
                        || started.elapsed() >= Duration::from_millis(max_retry_ms)
                    {
                        return (SendOutcome::EAgain, 0);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    let errno = io_errno(&err);
                    if is_fatal_send_errno(errno)
                        || matches!(
                            err.kind(),
                            std::io::ErrorKind::ConnectionReset
                                | std::io::ErrorKind::BrokenPipe
                                | std::io::ErrorKind::NotConnected
                                | std::io::ErrorKind::ConnectionAborted
                        )
                    {
                        warn!(self.log, "send fatal socket error, closing";
                              "conn_id" => self.id, "errno" => errno);
                        self.close_socket();
                        return (SendOutcome::Fail, 0);
                    }
                    warn!(self.log, "send error"; "conn_id" => self.id, "errno" => errno);
                    return (SendOutcome::Fail, 0);
                }
            }
        }
    }

    fn can_send(&mut self) -> SendOutcome {
        self.probe_writable()
    }

    fn recv_start(&mut self, out_buf: &mut Vec<u8>) -> RecvOutcome {
        out_buf.clear();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return RecvOutcome::ConnClosed,
        };
        out_buf.resize(RX_BUFFER_MAX_BYTES, 0);
        match stream.read(out_buf) {
            Ok(0) => {
                out_buf.clear();
                debug!(self.log, "peer closed"; "conn_id" => self.id);
                self.close_socket();
                RecvOutcome::ConnClosed
            }
            Ok(count) => {
                out_buf.truncate(count);
                self.bytes_read += count as u64;
                self.last_access_at = Instant::now();
                RecvOutcome::Ok
            }
            Err(ref err) if is_would_block(err) => {
                out_buf.clear();
                RecvOutcome::Ok
            }
            Err(err) => {
                out_buf.clear();
                let errno = io_errno(&err);
                if is_fatal_recv_errno(errno)
                    || matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::BrokenPipe
                            | std::io::ErrorKind::NotConnected
                            | std::io::ErrorKind::ConnectionAborted
                    )
                {
                    warn!(self.log, "recv fatal socket error, closing";
                          "conn_id" => self.id, "errno" => errno);
                    self.close_socket();
                    return RecvOutcome::ConnClosed;
                }
                warn!(self.log, "recv error"; "conn_id" => self.id, "errno" => errno);
                RecvOutcome::Error
            }
        }
    }

    fn recv_end(&mut self) {}
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        debug!(self.log, "client conn closed";
               "conn_id" => self.id,
               "bytes_read" => self.bytes_read,
               "bytes_written" => self.bytes_written,
               "open_secs" => self.opened_at.elapsed().as_secs());
        self.close_socket();
    }
}
