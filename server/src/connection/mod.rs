//! The per-connection I/O state machine shared by all three server flavors:
//! reads bytes off a socket, drives them through a [`Parser`], accumulates
//! argument bytes, executes complete commands against a [`Storage`], and
//! queues reply text for the write side to drain.
//!
//! The three server flavors differ only in how their caller schedules
//! reads and writes against readiness events, so the byte-pumping logic
//! lives here once and the flavor-specific wrappers in the sibling modules
//! supply only the dispatch strategy.

/// The MT-nonblock flavor: a thread pool dispatches readiness events.
pub mod mt_nonblocking;
/// The ST-coroutine flavor: a cooperative scheduler dispatches readiness.
pub mod st_coroutine;
/// The ST-nonblock flavor: one thread handles readiness events in-line.
pub mod st_nonblocking;

use std::borrow::BorrowMut;
use std::collections::VecDeque;
use std::io::IoSlice;

use protocol::{Command, ParseError, Parser};
use storage::Storage;

use crate::buffer::Buffer;

/// Initial/floor size of a connection's read scratch buffer: a fixed
/// 4 KiB scratch buffer, grown only as far as a single pending command's
/// argument bytes require.
pub const READ_BUF_SIZE: usize = 4096;

/// Caps how many queued replies a single vectored write gathers at once.
pub const MAX_GATHER: usize = 64;

/// Failure reading or parsing a connection's byte stream. Every variant is
/// terminal for the connection: the caller logs it and marks the
/// connection not alive, without affecting any other connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The byte stream did not match the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
}

#[derive(Debug)]
struct PendingCommand {
    command: Command,
    arg_remaining: usize,
}

/// The read/write state machine for one connection, independent of how it
/// is scheduled. `P` is the protocol parser in use; `execute` takes the
/// storage collaborator by reference so it can be a plain value (ST
/// flavors) or a shared `Arc` (MT flavor).
#[derive(Debug)]
pub struct ConnectionCore<P> {
    read_buf: Buffer,
    parser: P,
    pending: Option<PendingCommand>,
    arg_accum: Vec<u8>,
    write_queue: VecDeque<String>,
    write_off: usize,
}

impl<P: Parser> ConnectionCore<P> {
    /// Creates a connection state machine with an empty read/write side.
    pub fn new(parser: P) -> Self {
        Self {
            read_buf: Buffer::new(READ_BUF_SIZE),
            parser,
            pending: None,
            arg_accum: Vec::new(),
            write_queue: VecDeque::new(),
            write_off: 0,
        }
    }

    /// A mutable view of the tail of the read buffer a socket read should
    /// land in, and how many bytes it has room for before it would need to
    /// grow.
    pub fn read_target(&mut self) -> &mut [u8] {
        if self.read_buf.remaining_mut() < READ_BUF_SIZE {
            self.read_buf.reserve(READ_BUF_SIZE);
        }
        self.read_buf.borrow_mut()
    }

    /// Runs the read-path state machine over `n` freshly received bytes
    /// previously written via [`ConnectionCore::read_target`]:
    /// parses as many complete commands as the buffer holds, executes each
    /// against `storage`, and appends a `\r\n`-terminated reply to the
    /// write queue for every one.
    pub fn on_bytes_read(&mut self, n: usize, storage: &dyn Storage) -> Result<(), ConnectionError> {
        self.read_buf.mark_written(n);

        loop {
            if self.pending.is_none() {
                let (done, consumed) = self.parser.parse(&self.read_buf)?;
                if done {
                    let (command, arg_size) = self.parser.build()?;
                    let arg_remaining = if arg_size > 0 { arg_size + 2 } else { 0 };
                    self.pending = Some(PendingCommand {
                        command,
                        arg_remaining,
                    });
                }
                if consumed == 0 {
                    break;
                }
                self.read_buf.mark_read(consumed);
            }

            let Some(pending) = self.pending.as_mut() else {
                // parse() made progress but hasn't recognized a full header
                // yet (consumed > 0, done == false): go round again, there
                // may already be enough buffered for the rest of it.
                continue;
            };

            if pending.arg_remaining > 0 {
                let to_read = pending.arg_remaining.min(self.read_buf.remaining());
                if to_read == 0 {
                    break;
                }
                self.arg_accum.extend_from_slice(&self.read_buf[..to_read]);
                self.read_buf.mark_read(to_read);
                pending.arg_remaining -= to_read;
                if pending.arg_remaining > 0 {
                    break;
                }
            }

            let pending = self.pending.take().expect("checked Some above");
            let mut reply = String::new();
            storage.execute(&pending.command, &self.arg_accum, &mut reply);
            reply.push_str("\r\n");
            self.write_queue.push_back(reply);
            self.arg_accum.clear();
            self.parser.reset();
        }

        Ok(())
    }

    /// Whether there is anything queued to send — equivalently, whether
    /// the connection's writable readiness bit should be set.
    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Builds the scatter-gather buffer list for a single vectored write:
    /// up to [`MAX_GATHER`] queued replies, the first offset by
    /// `write_off` and the rest whole. Entry 0 is built first so it is
    /// never left uninitialized while the rest of the loop runs.
    pub fn gather_write_bufs(&self) -> Vec<IoSlice<'_>> {
        let mut bufs = Vec::with_capacity(self.write_queue.len().min(MAX_GATHER));
        for (i, entry) in self.write_queue.iter().take(MAX_GATHER).enumerate() {
            let bytes = entry.as_bytes();
            if i == 0 {
                bufs.push(IoSlice::new(&bytes[self.write_off..]));
            } else {
                bufs.push(IoSlice::new(bytes));
            }
        }
        bufs
    }

    /// Advances the write side by `written` bytes actually sent, popping
    /// fully-sent entries off the front of the queue.
    pub fn advance_write(&mut self, written: usize) {
        let mut written = written + self.write_off;
        while let Some(front) = self.write_queue.front() {
            let len = front.len();
            if written >= len {
                written -= len;
                self.write_queue.pop_front();
            } else {
                break;
            }
        }
        self.write_off = written;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::text::MemcachedParser;
    use storage::MemoryStorage;

    fn feed_all(core: &mut ConnectionCore<MemcachedParser>, storage: &dyn Storage, data: &[u8]) {
        let target = core.read_target();
        let n = data.len().min(target.len());
        target[..n].copy_from_slice(&data[..n]);
        core.on_bytes_read(n, storage).unwrap();
        if n < data.len() {
            feed_all(core, storage, &data[n..]);
        }
    }

    #[test]
    fn set_then_get_round_trip_produces_crlf_terminated_replies() {
        let storage = MemoryStorage::new();
        let mut core = ConnectionCore::new(MemcachedParser::default());

        feed_all(&mut core, &storage, b"set x 0 0 3\r\naaa\r\n");
        feed_all(&mut core, &storage, b"get x\r\n");

        let replies: Vec<_> = core
            .gather_write_bufs()
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        assert_eq!(replies, vec!["STORED\r\n", "VALUE x 0 3\r\naaa\r\nEND\r\n"]);
    }

    #[test]
    fn byte_at_a_time_fragmentation_matches_single_read() {
        let storage = MemoryStorage::new();
        let mut fragmented = ConnectionCore::new(MemcachedParser::default());
        for &byte in b"set y 0 0 2\r\nhi\r\nget y\r\n" {
            let target = fragmented.read_target();
            target[0] = byte;
            fragmented.on_bytes_read(1, &storage).unwrap();
        }

        let bulk_storage = MemoryStorage::new();
        let mut bulk = ConnectionCore::new(MemcachedParser::default());
        feed_all(&mut bulk, &bulk_storage, b"set y 0 0 2\r\nhi\r\nget y\r\n");

        let get_bytes = |c: &ConnectionCore<MemcachedParser>| {
            c.gather_write_bufs()
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(get_bytes(&fragmented), get_bytes(&bulk));
    }

    #[test]
    fn parser_error_leaves_no_bytes_written() {
        let storage = MemoryStorage::new();
        let mut core = ConnectionCore::new(MemcachedParser::default());
        let err = {
            let target = core.read_target();
            let data = b"frobnicate\r\n";
            target[..data.len()].copy_from_slice(data);
            core.on_bytes_read(data.len(), &storage)
        };
        assert!(err.is_err());
        assert!(!core.has_pending_writes());
    }

    #[test]
    fn partial_write_tracks_offset_and_clears_queue_once_drained() {
        let storage = MemoryStorage::new();
        let mut core = ConnectionCore::new(MemcachedParser::default());
        feed_all(&mut core, &storage, b"set k 0 0 5\r\nhello\r\n");
        feed_all(&mut core, &storage, b"get k\r\n");
        assert!(core.has_pending_writes());

        // "STORED\r\n" is 8 bytes; sending only 5 must not pop it.
        core.advance_write(5);
        assert_eq!(core.write_off, 5);
        assert!(core.has_pending_writes());

        let remaining: usize = core.write_queue.iter().map(|s| s.len()).sum::<usize>() - 5;
        core.advance_write(remaining);
        assert!(!core.has_pending_writes());
    }
}
