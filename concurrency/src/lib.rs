//! Concurrency primitives shared by the server's three dispatch flavors:
//! an elastic [`Executor`] thread pool and a single-threaded cooperative
//! [`coroutine::Engine`].

/// The cooperative, single-threaded coroutine scheduler.
pub mod coroutine;
/// The elastic thread pool.
pub mod executor;

pub use coroutine::{CoroId, Engine, Handle};
pub use executor::Executor;
