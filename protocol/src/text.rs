//! A line-oriented parser for the memcached text protocol family.

use crate::{Command, ParseError, Parser};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Set {
        key: String,
        flags: u32,
        exptime: i64,
        bytes: usize,
    },
    Get {
        keys: Vec<String>,
    },
    Delete {
        key: String,
    },
}

/// Recognizes `set`/`get`/`delete` command headers terminated by `\r\n`.
///
/// `MemcachedParser` is a single-command parser: after `build()` consumes a
/// recognized header, `reset()` must be called before the next `parse()`
/// call.
#[derive(Debug, Default)]
pub struct MemcachedParser {
    pending: Option<Pending>,
}

impl MemcachedParser {
    /// Creates a parser ready to recognize the next command header.
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

fn parse_line(line: &str) -> Result<Pending, ParseError> {
    let mut tokens = line.split(' ').filter(|t| !t.is_empty());
    let name = tokens.next().ok_or(ParseError::Malformed("empty"))?;

    match name {
        "get" => {
            let keys: Vec<String> = tokens.map(str::to_owned).collect();
            if keys.is_empty() {
                return Err(ParseError::Malformed("get"));
            }
            Ok(Pending::Get { keys })
        }
        "delete" => {
            let key = tokens
                .next()
                .ok_or(ParseError::Malformed("delete"))?
                .to_owned();
            Ok(Pending::Delete { key })
        }
        "set" => {
            let key = tokens.next().ok_or(ParseError::Malformed("set"))?.to_owned();
            let flags: u32 = tokens
                .next()
                .ok_or(ParseError::Malformed("set"))?
                .parse()
                .map_err(|_| ParseError::InvalidNumber("set"))?;
            let exptime: i64 = tokens
                .next()
                .ok_or(ParseError::Malformed("set"))?
                .parse()
                .map_err(|_| ParseError::InvalidNumber("set"))?;
            let bytes: usize = tokens
                .next()
                .ok_or(ParseError::Malformed("set"))?
                .parse()
                .map_err(|_| ParseError::InvalidNumber("set"))?;
            Ok(Pending::Set {
                key,
                flags,
                exptime,
                bytes,
            })
        }
        other => Err(ParseError::UnknownCommand(other.to_owned())),
    }
}

impl Parser for MemcachedParser {
    fn parse(&mut self, bytes: &[u8]) -> Result<(bool, usize), ParseError> {
        let Some(idx) = find_crlf(bytes) else {
            return Ok((false, 0));
        };
        let consumed = idx + 2;
        let line = std::str::from_utf8(&bytes[..idx]).map_err(|_| ParseError::InvalidEncoding)?;
        self.pending = Some(parse_line(line)?);
        Ok((true, consumed))
    }

    fn build(&mut self) -> Result<(Command, usize), ParseError> {
        match self.pending.take() {
            Some(Pending::Get { keys }) => Ok((Command::Get { keys }, 0)),
            Some(Pending::Delete { key }) => Ok((Command::Delete { key }, 0)),
            Some(Pending::Set {
                key,
                flags,
                exptime,
                bytes,
            }) => Ok((
                Command::Set {
                    key,
                    flags,
                    exptime,
                    bytes,
                },
                bytes,
            )),
            None => Err(ParseError::NotReady),
        }
    }

    fn reset(&mut self) {
        self.pending = None;
    }

    fn name(&self) -> &'static str {
        match self.pending {
            Some(Pending::Get { .. }) => "get",
            Some(Pending::Delete { .. }) => "delete",
            Some(Pending::Set { .. }) => "set",
            None => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_with_single_key() {
        let mut parser = MemcachedParser::new();
        let (done, consumed) = parser.parse(b"get k\r\nrest").unwrap();
        assert!(done);
        assert_eq!(consumed, 7);
        let (cmd, arg_size) = parser.build().unwrap();
        assert_eq!(arg_size, 0);
        assert_eq!(
            cmd,
            Command::Get {
                keys: vec!["k".to_owned()]
            }
        );
    }

    #[test]
    fn parses_get_with_multiple_keys() {
        let mut parser = MemcachedParser::new();
        let (done, _) = parser.parse(b"get a b c\r\n").unwrap();
        assert!(done);
        let (cmd, _) = parser.build().unwrap();
        assert_eq!(
            cmd,
            Command::Get {
                keys: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]
            }
        );
    }

    #[test]
    fn parses_set_header_and_reports_arg_size() {
        let mut parser = MemcachedParser::new();
        let (done, consumed) = parser.parse(b"set x 0 0 3\r\naaa\r\n").unwrap();
        assert!(done);
        assert_eq!(consumed, 13);
        let (cmd, arg_size) = parser.build().unwrap();
        assert_eq!(arg_size, 3);
        assert_eq!(
            cmd,
            Command::Set {
                key: "x".to_owned(),
                flags: 0,
                exptime: 0,
                bytes: 3
            }
        );
    }

    #[test]
    fn parses_delete() {
        let mut parser = MemcachedParser::new();
        let (done, _) = parser.parse(b"delete k\r\n").unwrap();
        assert!(done);
        let (cmd, arg_size) = parser.build().unwrap();
        assert_eq!(arg_size, 0);
        assert_eq!(
            cmd,
            Command::Delete {
                key: "k".to_owned()
            }
        );
    }

    #[test]
    fn incomplete_line_reports_not_done_with_zero_consumed() {
        let mut parser = MemcachedParser::new();
        let (done, consumed) = parser.parse(b"get k").unwrap();
        assert!(!done);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut parser = MemcachedParser::new();
        let err = parser.parse(b"frobnicate x\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnknownCommand("frobnicate".to_owned()));
    }

    #[test]
    fn build_before_parse_is_not_ready() {
        let mut parser = MemcachedParser::new();
        assert_eq!(parser.build().unwrap_err(), ParseError::NotReady);
    }

    #[test]
    fn reset_clears_pending_command() {
        let mut parser = MemcachedParser::new();
        parser.parse(b"get k\r\n").unwrap();
        parser.reset();
        assert_eq!(parser.build().unwrap_err(), ParseError::NotReady);
        assert_eq!(parser.name(), "unknown");
    }

    #[test]
    fn fragmented_header_across_two_parse_calls_only_completes_once_full() {
        let mut parser = MemcachedParser::new();
        let (done, consumed) = parser.parse(b"get k").unwrap();
        assert!(!done);
        assert_eq!(consumed, 0);
        // A real caller re-feeds the same unconsumed bytes plus whatever
        // newly arrived; since nothing was consumed, the buffer still
        // holds "get k" and appending "\r\n" now completes the line.
        let (done, consumed) = parser.parse(b"get k\r\n").unwrap();
        assert!(done);
        assert_eq!(consumed, 7);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn key_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,16}"
    }

    proptest! {
        // `get` with any number of whitespace-separated keys always builds
        // back out to exactly the keys that were typed in, in order.
        #[test]
        fn get_round_trips_arbitrary_key_list(keys in prop::collection::vec(key_strategy(), 1..8)) {
            let line = format!("get {}\r\n", keys.join(" "));
            let mut parser = MemcachedParser::new();
            let (done, consumed) = parser.parse(line.as_bytes()).unwrap();
            prop_assert!(done);
            prop_assert_eq!(consumed, line.len());
            let (cmd, arg_size) = parser.build().unwrap();
            prop_assert_eq!(arg_size, 0);
            prop_assert_eq!(cmd, Command::Get { keys });
        }

        // `set` always reports back the exact flags/exptime/bytes it was
        // given, regardless of their magnitude, and never panics.
        #[test]
        fn set_round_trips_arbitrary_numeric_fields(
            key in key_strategy(),
            flags in any::<u32>(),
            exptime in any::<i64>(),
            bytes in 0usize..4096,
        ) {
            let line = format!("set {key} {flags} {exptime} {bytes}\r\n");
            let mut parser = MemcachedParser::new();
            let (done, _) = parser.parse(line.as_bytes()).unwrap();
            prop_assert!(done);
            let (cmd, arg_size) = parser.build().unwrap();
            prop_assert_eq!(arg_size, bytes);
            prop_assert_eq!(
                cmd,
                Command::Set { key, flags, exptime, bytes }
            );
        }

        // No byte string, however malformed, makes `parse` panic — it
        // either recognizes a complete line or reports "need more bytes".
        #[test]
        fn parse_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let mut parser = MemcachedParser::new();
            let _ = parser.parse(&bytes);
        }
    }
}
