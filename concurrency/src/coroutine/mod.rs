//! A cooperative, single-threaded coroutine engine.
//!
//! Rather than copying a live native stack into a heap buffer on suspend
//! and switching via `setjmp`/`longjmp`, this engine builds on Rust's own
//! stackless, compiler-supported coroutines: every scheduled unit of work
//! is an `async fn`, suspension points are ordinary `.await`s on the
//! primitives below, and the engine itself is a small hand-rolled
//! single-threaded executor — no raw stack pointers, no unsafe copying,
//! nothing that depends on native stack-growth direction.
//!
//! The scheduling contract is `start`/`yield`/`sched`/`block`/`unblock`
//! over an `alive` and a `blocked` set of contexts, with a single
//! `current` context at a time.

mod engine;
mod waker;

pub use engine::{CoroId, Engine, Handle};
