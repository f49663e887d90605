//! Multi-threaded, non-blocking server shell: one acceptor thread runs
//! the `mio::Poll` loop; readiness events are dispatched onto a
//! [`concurrency::Executor`] sized by `config`'s watermark flags.

use server::config::Config;
use server::connection::mt_nonblocking;
use storage::MemoryStorage;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!(
        bind = %config.bind,
        low = config.low_watermark,
        high = config.high_watermark,
        max_queue = config.max_queue,
        "starting mt-nonblocking server"
    );
    let storage = MemoryStorage::with_shards(config.storage_shards);
    mt_nonblocking::run(
        config.bind,
        storage,
        config.low_watermark,
        config.high_watermark,
        config.max_queue,
        config.idle_time(),
    )?;
    Ok(())
}
