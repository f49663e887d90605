//! The wire protocol parser collaborator.
//!
//! This crate treats the protocol grammar itself as a secondary concern:
//! the `Parser` trait is the contract the connection state machine in the
//! `server` crate actually depends on, and `text::MemcachedParser` is one
//! concrete, line-oriented implementation of the memcached text protocol
//! family (`set`/`get`/`delete`) sufficient to drive a server end to end.

/// The memcached text-protocol implementation of [`Parser`].
pub mod text;

use thiserror::Error;

/// A fully parsed command header, ready to be handed to a storage backend
/// once any trailing argument bytes have been accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n`
    Set {
        /// Key to associate with `data`.
        key: String,
        /// Opaque flags, echoed back verbatim on `get`.
        flags: u32,
        /// Expiration, in seconds relative to now, or 0 for "never".
        exptime: i64,
        /// Number of data bytes that follow the header line.
        bytes: usize,
    },
    /// `get <key>*\r\n`
    Get {
        /// Keys requested, in request order.
        keys: Vec<String>,
    },
    /// `delete <key> [noreply]\r\n`
    Delete {
        /// Key to remove.
        key: String,
    },
}

impl Command {
    /// The command name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
        }
    }
}

/// Errors recognized while scanning a command header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The first token on the line is not a recognized command name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A command line did not carry enough whitespace-separated fields.
    #[error("malformed {0} command")]
    Malformed(&'static str),
    /// A numeric field (flags, exptime, byte count) did not parse as such.
    #[error("invalid numeric field in {0} command")]
    InvalidNumber(&'static str),
    /// The header line was not valid UTF-8.
    #[error("command line is not valid UTF-8")]
    InvalidEncoding,
    /// `build` was called before `parse` reported a complete header.
    #[error("no command ready to build")]
    NotReady,
}

/// The parser collaborator contract.
///
/// Implementations are single-command state machines: `parse` is fed bytes
/// until it recognizes a complete header, `build` converts that header into
/// a [`Command`] (and reports how many argument bytes must follow), and
/// `reset` prepares the parser to recognize the next command.
pub trait Parser {
    /// Feed `bytes` to the parser.
    ///
    /// Returns `(true, consumed)` once a complete command header has been
    /// recognized, `(false, consumed)` if more bytes are needed (`consumed`
    /// may be 0 if no full line was found yet). `consumed` is always set.
    fn parse(&mut self, bytes: &[u8]) -> Result<(bool, usize), ParseError>;

    /// Convert the header most recently recognized by `parse` into a
    /// [`Command`], reporting how many trailing argument bytes (excluding
    /// the `\r\n` terminator) must still be read.
    ///
    /// Only valid to call after `parse` returned `(true, _)`.
    fn build(&mut self) -> Result<(Command, usize), ParseError>;

    /// Reset internal state after a command has been fully handled (or
    /// after a recoverable parse failure), so the next `parse` call starts
    /// fresh.
    fn reset(&mut self);

    /// The name of the command currently recognized, for logging. Valid
    /// after a successful `parse`.
    fn name(&self) -> &'static str;
}
