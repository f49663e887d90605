//! A `Waker` that does nothing when woken.
//!
//! The engine in this module never relies on a `Future` waking itself to
//! get re-polled: `Engine::run_one` drives every alive coroutine directly
//! from its own scheduling loop, and suspension points only ever occur
//! inside `yield_now`, `sched`, or `block_self` — there is no preemption —
//! so there is nothing meaningful for a wake-up to do.

use std::task::{RawWaker, RawWakerVTable, Waker};

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake, drop);

fn clone(_: *const ()) -> RawWaker {
    raw_waker()
}

fn wake(_: *const ()) {}

fn drop(_: *const ()) {}

fn raw_waker() -> RawWaker {
    RawWaker::new(std::ptr::null(), &VTABLE)
}

/// Builds a `Waker` with no-op clone/wake/drop behavior.
pub fn noop_waker() -> Waker {
    // Safety: the vtable's functions never dereference the data pointer,
    // so a null, unused data pointer is sound for the lifetime of the
    // resulting `Waker`.
    unsafe { Waker::from_raw(raw_waker()) }
}
