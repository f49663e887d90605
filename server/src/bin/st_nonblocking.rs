//! Single-threaded, non-blocking server shell: one `mio::Poll` loop,
//! connections serviced in-line on the same thread that accepted them.
//! No executor, no coroutine engine — the simplest of the three flavors.

use server::config::Config;
use server::connection::st_nonblocking;
use storage::MemoryStorage;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!(bind = %config.bind, "starting st-nonblocking server");
    let storage = MemoryStorage::with_shards(config.storage_shards);
    st_nonblocking::run(config.bind, storage)?;
    Ok(())
}
