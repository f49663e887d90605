//! The storage collaborator: an opaque entry point that executes a parsed
//! [`protocol::Command`] against a key-value backend and produces reply
//! text for the connection to send back to the peer.
//!
//! Eviction, persistence, and replication are out of scope here; this
//! crate exists only so the workspace has a real collaborator to execute
//! against.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use protocol::Command;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    flags: u32,
    data: Vec<u8>,
}

/// The storage collaborator contract: a synchronous `execute(storage_ref,
/// argument_bytes, &reply_text)` entry point, safe to call concurrently
/// from the MT-nonblock flavor.
pub trait Storage: Send + Sync {
    /// Execute `command` against the store. `argument` holds the data
    /// bytes accumulated for the command (empty for `get`/`delete`).
    /// Appends reply text (without a trailing `\r\n`; the connection state
    /// machine adds that) to `reply`.
    fn execute(&self, command: &Command, argument: &[u8], reply: &mut String);
}

/// A sharded in-memory key-value store.
///
/// Sharding by key hash lets independent keys be mutated concurrently from
/// separate MT-nonblock worker threads without a single global lock, while
/// keeping each shard's own invariant (a plain `HashMap` behind a mutex)
/// trivial to reason about.
#[derive(Debug)]
pub struct MemoryStorage {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStorage {
    /// Creates an empty store with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(SHARD_COUNT)
    }

    /// Creates an empty store with a specific shard count (must be > 0).
    pub fn with_shards(shards: usize) -> Self {
        assert!(shards > 0, "shard count must be positive");
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn execute(&self, command: &Command, argument: &[u8], reply: &mut String) {
        match command {
            Command::Set {
                key,
                flags,
                exptime: _,
                bytes,
            } => {
                let data = argument.get(..*bytes).unwrap_or(argument).to_vec();
                let mut shard = self.shard_for(key).lock().unwrap();
                shard.insert(
                    key.clone(),
                    Entry {
                        flags: *flags,
                        data,
                    },
                );
                reply.push_str("STORED");
            }
            Command::Get { keys } => {
                for key in keys {
                    let shard = self.shard_for(key).lock().unwrap();
                    if let Some(entry) = shard.get(key) {
                        reply.push_str(&format!(
                            "VALUE {} {} {}\r\n",
                            key,
                            entry.flags,
                            entry.data.len()
                        ));
                        reply.push_str(&String::from_utf8_lossy(&entry.data));
                        reply.push_str("\r\n");
                    }
                }
                reply.push_str("END");
            }
            Command::Delete { key } => {
                let mut shard = self.shard_for(key).lock().unwrap();
                if shard.remove(key).is_some() {
                    reply.push_str("DELETED");
                } else {
                    reply.push_str("NOT_FOUND");
                }
            }
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Whatever bytes are set under a key, get reports exactly those
        // bytes (and the flags echoed back verbatim), for any key/data/flag
        // combination and any shard count the store is built with.
        #[test]
        fn set_then_get_returns_exactly_what_was_set(
            key in "[a-zA-Z0-9_-]{1,16}",
            data in prop::collection::vec(any::<u8>(), 0..256),
            flags in any::<u32>(),
            shards in 1usize..8,
        ) {
            let storage = MemoryStorage::with_shards(shards);
            let mut reply = String::new();
            storage.execute(
                &Command::Set { key: key.clone(), flags, exptime: 0, bytes: data.len() },
                &data,
                &mut reply,
            );
            prop_assert_eq!(reply, "STORED");

            let mut reply = String::new();
            storage.execute(&Command::Get { keys: vec![key.clone()] }, b"", &mut reply);
            let expected = format!(
                "VALUE {key} {flags} {}\r\n{}\r\nEND",
                data.len(),
                String::from_utf8_lossy(&data)
            );
            prop_assert_eq!(reply, expected);
        }

        // Deleting a key that was never set is always NOT_FOUND, whatever
        // the key looks like and however many shards back the store.
        #[test]
        fn delete_of_unknown_key_is_always_not_found(
            key in "[a-zA-Z0-9_-]{1,16}",
            shards in 1usize..8,
        ) {
            let storage = MemoryStorage::with_shards(shards);
            let mut reply = String::new();
            storage.execute(&Command::Delete { key }, b"", &mut reply);
            prop_assert_eq!(reply, "NOT_FOUND");
        }
    }
}
