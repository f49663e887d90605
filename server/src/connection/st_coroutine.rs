//! The **ST-coroutine** flavor: a single OS thread runs
//! [`concurrency::coroutine::Engine`]; one coroutine per connection shares
//! that thread with a "server" coroutine that owns the `mio::Poll` wait
//! and hands control to whichever connection has a readiness event.
//!
//! Each connection's coroutine body does `do_read`/`do_write` then hands
//! control straight back to the server coroutine via
//! [`concurrency::Handle::sched`] — a direct handoff, not a generic yield.
//! `start`/`sched`/`block`/`unblock` are the only suspension points;
//! nothing here yields anywhere else.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, warn};

use concurrency::{CoroId, Engine, Handle};
use protocol::text::MemcachedParser;
use storage::Storage;

use super::ConnectionCore;

const LISTEN_TOKEN: Token = Token(usize::MAX);

struct ConnState {
    socket: MioTcpStream,
    token: Token,
    alive: bool,
    readable: bool,
    writable: bool,
    core: ConnectionCore<MemcachedParser>,
    registry: Rc<Registry>,
}

impl ConnState {
    fn new(token: Token, socket: MioTcpStream, registry: Rc<Registry>) -> Self {
        Self {
            socket,
            token,
            alive: true,
            readable: false,
            writable: false,
            core: ConnectionCore::new(MemcachedParser::default()),
            registry,
        }
    }

    fn register(&mut self) -> io::Result<()> {
        self.registry
            .register(&mut self.socket, self.token, Interest::READABLE)
    }

    fn reregister(&mut self) -> io::Result<()> {
        let interest = if self.core.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.registry.reregister(&mut self.socket, self.token, interest)
    }

    fn deregister(&mut self) -> io::Result<()> {
        self.registry.deregister(&mut self.socket)
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

/// One connection's coroutine body: service whatever readiness the server
/// coroutine has flagged, then hand control straight back to it.
async fn connection_body(
    handle: Handle,
    server_id: CoroId,
    storage: Rc<dyn Storage>,
    state: Rc<RefCell<ConnState>>,
) {
    loop {
        let alive = {
            let mut st = state.borrow_mut();
            if st.readable {
                st.readable = false;
                st.do_read(storage.as_ref());
            }
            if st.alive && st.writable {
                st.writable = false;
                st.do_write();
            }
            if st.alive {
                let _ = st.reregister();
            }
            st.alive
        };

        if !alive {
            let _ = state.borrow_mut().deregister();
            return;
        }

        handle.sched(Some(server_id)).await;
    }
}

/// The server coroutine: owns the listening socket and the readiness
/// multiplexer, starts a coroutine per accepted connection, and after each
/// `poll` wakes exactly the connections with events pending.
async fn server_body(
    handle: Handle,
    mut listener: MioTcpListener,
    mut poll: Poll,
    registry: Rc<Registry>,
    storage: Rc<dyn Storage>,
) {
    let my_id = handle.current().expect("server body only ever runs as a coroutine");
    let mut conns: HashMap<Token, (CoroId, Rc<RefCell<ConnState>>)> = HashMap::new();
    let mut next_token = 0usize;
    let mut events = Events::with_capacity(1024);

    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            warn!(%err, "poll failed, stopping coroutine server");
            return;
        }

        let mut to_run = Vec::new();
        for event in events.iter() {
            if event.token() == LISTEN_TOKEN {
                loop {
                    match listener.accept() {
                        Ok((socket, addr)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            let mut conn = ConnState::new(token, socket, registry.clone());
                            if conn.register().is_ok() {
                                let state = Rc::new(RefCell::new(conn));
                                let id = handle.start({
                                    let state = state.clone();
                                    let storage = storage.clone();
                                    move |handle| connection_body(handle, my_id, storage, state)
                                });
                                debug!(%addr, ?token, "accepted coroutine connection");
                                conns.insert(token, (id, state));
                            }
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            break;
                        }
                    }
                }
                continue;
            }

            if let Some((id, state)) = conns.get(&event.token()) {
                let mut st = state.borrow_mut();
                st.readable |= event.is_readable();
                st.writable |= event.is_writable();
                drop(st);
                to_run.push(*id);
            }
        }

        for id in to_run {
            handle.sched(Some(id)).await;
        }

        conns.retain(|_, (_, state)| state.borrow().alive);
    }
}

/// Runs the single-threaded coroutine-scheduled server: starts the server
/// coroutine and drives the engine until it (and, transitively, every
/// connection) exits.
pub fn run(bind: SocketAddr, storage: impl Storage + 'static) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut listener = MioTcpListener::bind(bind)?;
    poll.registry()
        .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
    let registry = Rc::new(poll.registry().try_clone()?);

    let engine = Engine::new();
    let storage: Rc<dyn Storage> = Rc::new(storage);
    engine.start(move |handle| server_body(handle, listener, poll, registry, storage));
    engine.run_until_idle();
    Ok(())
}
