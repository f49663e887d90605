//! The **MT-nonblock** flavor: one acceptor thread runs the `mio::Poll`
//! loop; each readiness event is dispatched onto the [`concurrency::Executor`]
//! thread pool, and `Arc<Mutex<Connection>>` is itself the per-connection
//! mutex serializing handler invocations — locking it is what makes
//! `do_read`/`do_write` mutually exclusive regardless of which pool worker
//! runs them.
//!
//! Readiness events are dispatched off the poll thread onto the executor,
//! and completions are drained back through a `Waker`-backed channel so
//! the poll loop can reregister or retire each connection.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, warn};

use concurrency::Executor;
use protocol::text::MemcachedParser;
use storage::Storage;

use super::ConnectionCore;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

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

    fn reregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let interest = if self.core.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.socket, self.token, interest)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

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

/// Runs the acceptor/poll loop on the calling thread, dispatching readiness
/// events to an internally-owned [`Executor`] sized by
/// `low`/`high`/`max_queue`/`idle_time`.
pub fn run(
    bind: SocketAddr,
    storage: impl Storage + 'static,
    low: usize,
    high: usize,
    max_queue: usize,
    idle_time: Duration,
) -> io::Result<()> {
    let storage = Arc::new(storage);
    let executor = Executor::new(low, high, max_queue, idle_time);

    let mut poll = Poll::new()?;
    let mut listener = MioTcpListener::bind(bind)?;
    poll.registry()
        .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (done_tx, done_rx): (Sender<Token>, Receiver<Token>) = unbounded();

    let mut connections: Slab<Arc<Mutex<Connection>>> = Slab::new();
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
                                entry.insert(Arc::new(Mutex::new(conn)));
                            }
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) => return Err(err),
                    }
                },

                WAKE_TOKEN => loop {
                    match done_rx.try_recv() {
                        Ok(token) => {
                            if let Some(conn) = connections.get(token.0) {
                                let mut locked = conn.lock().unwrap();
                                let drop_it = if !locked.alive {
                                    let _ = locked.deregister(poll.registry());
                                    true
                                } else {
                                    locked.reregister(poll.registry()).is_err()
                                };
                                drop(locked);
                                if drop_it {
                                    connections.remove(token.0);
                                }
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return Ok(()),
                    }
                },

                token => {
                    let Some(conn) = connections.get(token.0) else {
                        continue;
                    };
                    let conn = conn.clone();
                    let storage = storage.clone();
                    let done_tx = done_tx.clone();
                    let waker = waker.clone();
                    let readable = event.is_readable();
                    let writable = event.is_writable();

                    let admitted = executor.execute(move || {
                        let mut locked = conn.lock().unwrap();
                        if readable {
                            locked.do_read(storage.as_ref());
                        }
                        if locked.alive && writable {
                            locked.do_write();
                        }
                        drop(locked);
                        let _ = done_tx.send(token);
                        let _ = waker.wake();
                    });

                    if !admitted {
                        warn!(?token, "executor saturated, dropping readiness event");
                    }
                }
            }
        }
    }
}
