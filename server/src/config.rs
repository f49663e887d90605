//! Shared CLI configuration for the three server binaries.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Flags common to `st-nonblocking`, `mt-nonblocking`, and `st-coroutine`.
///
/// The core this crate implements takes no position on bind address,
/// executor sizing, or log verbosity; those are outer-shell concerns each
/// binary wires up the same way.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Config {
    /// Address to bind the listening socket to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Minimum number of executor worker threads (MT flavor only).
    #[arg(long, default_value_t = 4)]
    pub low_watermark: usize,

    /// Maximum number of executor worker threads (MT flavor only).
    #[arg(long, default_value_t = 16)]
    pub high_watermark: usize,

    /// Maximum number of queued tasks before the executor rejects new work
    /// (MT flavor only).
    #[arg(long, default_value_t = 256)]
    pub max_queue: usize,

    /// How long an executor worker waits idle above the low watermark
    /// before it is reaped (MT flavor only), in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub idle_time_ms: u64,

    /// Number of shards the in-memory store splits its keyspace across.
    #[arg(long, default_value_t = 16)]
    pub storage_shards: usize,
}

impl Config {
    /// Parses `Config` from the process's command line.
    pub fn from_args() -> Self {
        Parser::parse()
    }

    /// Idle-reap timeout as a `Duration`.
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }
}
