//! The **ST-nonblock** flavor: a single thread runs one `mio::Poll` loop
//! and calls straight into [`ConnectionCore`] — no dispatch indirection at
//! all. The accept loop keeps one `mio::Poll`, a `Slab` of connections
//! keyed by `Token`, and a sentinel listen token.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, warn};

use protocol::text::MemcachedParser;
use storage::Storage;

use super::ConnectionCore;

const LISTEN_TOKEN: Token = Token(usize::MAX);

/// One socket's read/write state, dispatched in-line on the server's only
/// thread.
struct Connection {
    socket: MioTcpStream,
    token: Token,
    alive: bool,
    core: ConnectionCore<MemcachedParser>,
}

impl Connection {
    fn new(token: Token, socket: MioTcpStream) -> Self {
        Self {
            socket,
            token,
            alive: true,
            core: ConnectionCore::new(MemcachedParser::default()),
        }
    }

    fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.register(&mut self.socket, self.token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    fn reregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        // Asymmetric on purpose: once there is output queued, stop polling
        // for more input until the reply has gone out.
        let interest = if self.core.has_pending_writes() {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.socket, self.token, interest)
    }

    /// Reads until the socket would block, feeding every chunk through the
    /// shared state machine.
    ///
    /// Only a clean close (`Ok(0)`) or a non-retriable error marks the
    /// connection dead; a plain would-block return leaves it alive.
    fn do_read(&mut self, storage: &dyn Storage) {
        loop {
            let target = self.core.read_target();
            match self.socket.read(target) {
                Ok(0) => {
                    debug!(token = ?self.token, "connection closed");
                    self.alive = false;
                    return;
                }
                Ok(n) => {
                    if let Err(err) = self.core.on_bytes_read(n, storage) {
                        warn!(token = ?self.token, %err, "protocol error, closing connection");
                        self.alive = false;
                        return;
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(token = ?self.token, %err, "read failed, closing connection");
                    self.alive = false;
                    return;
                }
            }
        }
    }

    fn do_write(&mut self) {
        while self.core.has_pending_writes() {
            let bufs = self.core.gather_write_bufs();
            match self.socket.write_vectored(&bufs) {
                Ok(0) => {
                    self.alive = false;
                    return;
                }
                Ok(n) => self.core.advance_write(n),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(token = ?self.token, %err, "write failed, closing connection");
                    self.alive = false;
                    return;
                }
            }
        }
    }
}

/// Runs the single-threaded, in-line event loop: one `mio::Poll`, accepting
/// new sockets and servicing readiness events on the same thread that owns
/// them.
pub fn run(bind: SocketAddr, storage: impl Storage + 'static) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut listener = MioTcpListener::bind(bind)?;
    poll.registry()
        .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<Connection> = Slab::new();
    let mut events = Events::with_capacity(1024);

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTEN_TOKEN => loop {
                    match listener.accept() {
                        Ok((socket, addr)) => {
                            let entry = connections.vacant_entry();
                            let token = Token(entry.key());
                            let mut conn = Connection::new(token, socket);
                            if conn.register(poll.registry()).is_ok() {
                                debug!(%addr, ?token, "accepted connection");
                                entry.insert(conn);
                            }
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) => return Err(err),
                    }
                },
                token => {
                    let Some(conn) = connections.get_mut(token.0) else {
                        continue;
                    };

                    if event.is_readable() {
                        conn.do_read(&storage);
                    }
                    if conn.alive && event.is_writable() {
                        conn.do_write();
                    }

                    if !conn.alive {
                        let _ = conn.deregister(poll.registry());
                        connections.remove(token.0);
                    } else if conn.reregister(poll.registry()).is_err() {
                        let _ = conn.deregister(poll.registry());
                        connections.remove(token.0);
                    }
                }
            }
        }
    }
}
