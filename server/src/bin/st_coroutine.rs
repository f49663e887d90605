//! Single-threaded, coroutine-scheduled server shell: one OS thread runs
//! [`concurrency::coroutine::Engine`]; each connection is its own
//! coroutine, cooperatively scheduled alongside a "server" coroutine that
//! owns the readiness multiplexer.

use server::config::Config;
use server::connection::st_coroutine;
use storage::MemoryStorage;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!(bind = %config.bind, "starting st-coroutine server");
    let storage = MemoryStorage::with_shards(config.storage_shards);
    st_coroutine::run(config.bind, storage)?;
    Ok(())
}
