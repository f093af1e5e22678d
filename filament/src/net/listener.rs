use crate::net::client::{ClientConn, ClientId, SocketClient};
use crate::net::defs::{io_errno, is_would_block};
use lumen::logging::{self, debug, error, info, warn, Logger};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread;
use std::time::Duration;

const LISTEN_TOKEN: Token = Token(0);
const SOCKET_RETRY_DELAY_MS: u64 = 1000;
const REBIND_DELAY_MS: u64 = 5000;
const MAX_CONSEC_ACCEPT_ERRORS: u32 = 50;

/// Classification of an `accept` failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcceptErrorClass {
    /// Overloaded-stack class of errors: wait briefly and keep accepting.
    Transient,
    /// Nothing pending; wait for readiness.
    WouldBlock,
    /// Listening socket is unusable; recreate and rebind it.
    Rebind,
}

pub fn classify_accept_errno(errno: i32) -> AcceptErrorClass {
    if errno == libc::ENETDOWN
        || errno == libc::EPROTO
        || errno == libc::ENOPROTOOPT
        || errno == libc::EHOSTDOWN
        || errno == libc::ECONNABORTED
        || errno == libc::ENOBUFS
        || errno == libc::EHOSTUNREACH
        || errno == libc::EOPNOTSUPP
        || errno == libc::ENETUNREACH
        || errno == libc::ENFILE
    {
        AcceptErrorClass::Transient
    } else if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EINPROGRESS {
        AcceptErrorClass::WouldBlock
    } else {
        AcceptErrorClass::Rebind
    }
}

/// Long-running accept loop. Creates, binds and listens on the configured
/// port, then accepts connections and hands each one off via the callback.
/// A refused hand-off drops (and thereby closes) the connection.
pub struct Listener {
    port: u16,
    backlog: usize,
    log: Logger,
}

impl Listener {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(port: u16, backlog: usize, log: L) -> Listener {
        Listener {
            port,
            backlog,
            log: logging::child(log),
        }
    }

    /// Runs forever: `CreateSocket -> Bind -> Listen -> AcceptLoop`, going
    /// back to socket creation when the accept loop reports a rebind-required
    /// condition or too many consecutive transient errors.
    pub fn run<F>(&self, mut hand_off: F)
    where
        F: FnMut(Box<dyn ClientConn>) -> bool,
    {
        let mut next_client_id: ClientId = 0;
        loop {
            let mut listener = match self.bind_listener() {
                Some(listener) => listener,
                None => {
                    thread::sleep(Duration::from_millis(SOCKET_RETRY_DELAY_MS));
                    continue;
                }
            };

            let mut poll = match Poll::new() {
                Ok(poll) => poll,
                Err(err) => {
                    warn!(self.log, "listener poll create failed"; "err" => %err);
                    thread::sleep(Duration::from_millis(SOCKET_RETRY_DELAY_MS));
                    continue;
                }
            };
            if let Err(err) = poll
                .registry()
                .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)
            {
                warn!(self.log, "listener register failed"; "err" => %err);
                thread::sleep(Duration::from_millis(SOCKET_RETRY_DELAY_MS));
                continue;
            }

            info!(self.log, "listening"; "port" => self.port);
            self.accept_loop(&mut listener, &mut poll, &mut next_client_id, &mut hand_off);

            error!(self.log, "listener stopped, rebinding"; "port" => self.port);
            thread::sleep(Duration::from_millis(REBIND_DELAY_MS));
        }
    }

    fn bind_listener(&self) -> Option<TcpListener> {
        let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(self.log, "failed to create listener socket"; "err" => %err);
                return None;
            }
        };
        let _ = socket.set_reuse_address(true);
        if let Err(err) = socket.set_nonblocking(true) {
            warn!(self.log, "failed to set listener non-blocking"; "err" => %err);
            return None;
        }
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        if let Err(err) = socket.bind(&addr.into()) {
            warn!(self.log, "failed to bind"; "port" => self.port, "err" => %err);
            return None;
        }
        if let Err(err) = socket.listen(self.backlog as i32) {
            warn!(self.log, "failed to listen"; "port" => self.port, "err" => %err);
            return None;
        }
        Some(TcpListener::from_std(socket.into()))
    }

    fn accept_loop<F>(
        &self,
        listener: &mut TcpListener,
        poll: &mut Poll,
        next_client_id: &mut ClientId,
        hand_off: &mut F,
    ) where
        F: FnMut(Box<dyn ClientConn>) -> bool,
    {
        let mut events = Events::with_capacity(4);
        let mut consec_errors: u32 = 0;
        loop {
            if let Err(err) = poll.poll(&mut events, None) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(self.log, "listener poll failed"; "err" => %err);
                return;
            }

            // Drain all pending connections before waiting again
            loop {
                match listener.accept() {
                    Ok((stream, peer_addr)) => {
                        consec_errors = 0;
                        *next_client_id += 1;
                        debug!(self.log, "accepted connection";
                               "conn_id" => *next_client_id, "peer" => %peer_addr);
                        let conn = SocketClient::new(stream, *next_client_id, &self.log);
                        if !hand_off(Box::new(conn)) {
                            debug!(self.log, "connection refused by hand-off";
                                   "conn_id" => *next_client_id);
                            // Dropping the connection closes the socket
                        }
                    }
                    Err(err) if is_would_block(&err) => break,
                    Err(err) => {
                        let errno = io_errno(&err);
                        match classify_accept_errno(errno) {
                            AcceptErrorClass::WouldBlock => break,
                            AcceptErrorClass::Transient => {
                                warn!(self.log, "transient accept error";
                                      "errno" => errno, "consec" => consec_errors);
                                thread::sleep(Duration::from_millis(SOCKET_RETRY_DELAY_MS));
                                consec_errors += 1;
                                if consec_errors > MAX_CONSEC_ACCEPT_ERRORS {
                                    return;
                                }
                            }
                            AcceptErrorClass::Rebind => {
                                warn!(self.log, "accept error requires rebind"; "errno" => errno);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
