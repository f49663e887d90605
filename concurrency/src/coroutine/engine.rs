use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use slab::Slab;
use tracing::trace;

use super::waker::noop_waker;

/// Identifies one scheduled coroutine within an [`Engine`]'s arena.
///
/// A plain arena index (`slab::Slab` key) rather than an intrusive
/// `prev`/`next` pointer pair; `alive`/`blocked` list membership is just
/// ordinary collections keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroId(usize);

struct Task {
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
}

struct Inner {
    tasks: Slab<Task>,
    alive: VecDeque<CoroId>,
    blocked: HashSet<CoroId>,
    current: Option<CoroId>,
    next_to_run: Option<CoroId>,
}

impl Inner {
    fn block_id(&mut self, id: CoroId) {
        if self.blocked.contains(&id) {
            return;
        }
        self.alive.retain(|&x| x != id);
        self.blocked.insert(id);
    }

    fn unblock_id(&mut self, id: CoroId) {
        if !self.blocked.remove(&id) {
            return;
        }
        // Splice the unblocked context onto the *front* of `alive` so it
        // is the next coroutine serviced.
        self.alive.push_front(id);
    }
}

/// A single-threaded cooperative scheduler over a set of `async` tasks.
///
/// `Engine` owns the arena and the alive/blocked membership; [`Handle`] is
/// the cheaply-cloned, `Rc`-backed reference a running coroutine's own
/// `async fn` body uses to call `yield_now`/`sched`/`block_self`.
pub struct Engine {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with no coroutines.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                tasks: Slab::new(),
                alive: VecDeque::new(),
                blocked: HashSet::new(),
                current: None,
                next_to_run: None,
            })),
        }
    }

    /// A handle that coroutine bodies can use to call back into the
    /// engine that is running them.
    pub fn handle(&self) -> Handle {
        Handle {
            inner: self.inner.clone(),
        }
    }

    /// Spawns `f`, applied to a [`Handle`] for this engine, as a new
    /// coroutine attached to `alive`.
    pub fn start<F, Fut>(&self, f: F) -> CoroId
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        start_on(&self.inner, f)
    }

    /// Blocks `id` directly, without requiring it to be the currently
    /// running coroutine. Used to block a coroutine from outside any
    /// coroutine body, e.g. a connection's coroutine blocked externally
    /// pending I/O readiness.
    pub fn block(&self, id: CoroId) {
        self.inner.borrow_mut().block_id(id);
    }

    /// Reverses [`Engine::block`]; idempotent if `id` is not blocked.
    pub fn unblock(&self, id: CoroId) {
        self.inner.borrow_mut().unblock_id(id);
    }

    /// Whether `id` is presently on the blocked list.
    pub fn is_blocked(&self, id: CoroId) -> bool {
        self.inner.borrow().blocked.contains(&id)
    }

    /// Number of coroutines eligible to run.
    pub fn alive_count(&self) -> usize {
        self.inner.borrow().alive.len()
    }

    /// Number of coroutines presently blocked.
    pub fn blocked_count(&self) -> usize {
        self.inner.borrow().blocked.len()
    }

    /// Runs exactly one scheduling step: picks the coroutine requested by
    /// the previous step's `sched` (if any and still eligible), else the
    /// next alive coroutine in FIFO order, and polls it once. Returns
    /// `false` if there was nothing eligible to run.
    pub fn run_one(&self) -> bool {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let explicit = inner.next_to_run.take();
            match explicit {
                Some(target) if inner.alive.contains(&target) => {
                    inner.alive.retain(|&x| x != target);
                    Some(target)
                }
                _ => inner.alive.pop_front(),
            }
        };

        let Some(id) = id else {
            return false;
        };

        let mut future = {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(id);
            inner
                .tasks
                .get_mut(id.0)
                .expect("scheduled id missing from arena")
                .future
                .take()
                .expect("coroutine polled while already running")
        };

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);

        let mut inner = self.inner.borrow_mut();
        inner.current = None;
        match poll {
            Poll::Ready(()) => {
                trace!(?id, "coroutine exited");
                inner.tasks.remove(id.0);
            }
            Poll::Pending => {
                inner.tasks.get_mut(id.0).unwrap().future = Some(future);
                if !inner.blocked.contains(&id) {
                    inner.alive.push_back(id);
                }
            }
        }

        true
    }

    /// Drives `run_one` until nothing is eligible to run (the alive list
    /// is empty — every coroutine either exited or is blocked).
    pub fn run_until_idle(&self) {
        while self.run_one() {}
    }
}

fn start_on<F, Fut>(inner: &Rc<RefCell<Inner>>, f: F) -> CoroId
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    let future = Box::pin(f(Handle {
        inner: inner.clone(),
    }));
    let mut guard = inner.borrow_mut();
    let id = CoroId(guard.tasks.insert(Task {
        future: Some(future),
    }));
    guard.alive.push_back(id);
    id
}

/// A coroutine's own reference back to the [`Engine`] scheduling it.
///
/// Cloning is cheap (an `Rc` clone); a `Handle` is only meaningful on the
/// thread that owns the originating `Engine`.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<RefCell<Inner>>,
}

impl Handle {
    /// Spawns a new coroutine, the same as [`Engine::start`]. Lets a
    /// running coroutine bring up further coroutines of its own — the
    /// "server" coroutine in the coroutine-scheduled connection flavor
    /// uses this to start one coroutine per accepted socket.
    pub fn start<F, Fut>(&self, f: F) -> CoroId
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        start_on(&self.inner, f)
    }

    /// The id of the coroutine currently being polled through this
    /// engine, if any.
    pub fn current(&self) -> Option<CoroId> {
        self.inner.borrow().current
    }

    /// Suspends once, handing control back to the engine's scheduling
    /// loop so some other alive coroutine (or the same one, if it is the
    /// only one left) gets a turn.
    pub fn yield_now(&self) -> YieldOnce {
        YieldOnce { polled: false }
    }

    /// Requests that `target` run next, then suspends. If `target` is
    /// `None`, behaves like `yield_now`. If `target` is the currently
    /// running coroutine or is blocked, this is a no-op and control is
    /// *not* relinquished at all.
    pub async fn sched(&self, target: Option<CoroId>) {
        let Some(target) = target else {
            self.yield_now().await;
            return;
        };

        let skip = {
            let inner = self.inner.borrow();
            Some(target) == inner.current || inner.blocked.contains(&target)
        };
        if skip {
            return;
        }

        self.inner.borrow_mut().next_to_run = Some(target);
        self.yield_now().await;
    }

    /// Blocks the currently running coroutine and yields. Panics if called
    /// outside a coroutine body (there is no "current" to block).
    pub async fn block_self(&self) {
        let me = self
            .inner
            .borrow()
            .current
            .expect("block_self called outside a running coroutine");
        self.inner.borrow_mut().block_id(me);
        self.yield_now().await;
    }

    /// Unblocks `id` so it becomes eligible to run again. Safe to call
    /// from a different coroutine's body, or from outside any coroutine.
    pub fn unblock(&self, id: CoroId) {
        self.inner.borrow_mut().unblock_id(id);
    }
}

/// A future that is `Pending` exactly once, then `Ready`. The atomic unit
/// of suspension every other primitive in this module is built from.
pub struct YieldOnce {
    polled: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn two_coroutines_run_to_completion_and_alive_empties() {
        let engine = Engine::new();
        let ran = Rc::new(Cell::new(0));

        let ran_f = ran.clone();
        engine.start(move |handle| async move {
            handle.yield_now().await;
            ran_f.set(ran_f.get() + 1);
        });
        let ran_g = ran.clone();
        engine.start(move |handle| async move {
            handle.yield_now().await;
            ran_g.set(ran_g.get() + 1);
        });

        engine.run_until_idle();

        assert_eq!(ran.get(), 2);
        assert_eq!(engine.alive_count(), 0);
        assert_eq!(engine.blocked_count(), 0);
    }

    #[test]
    fn block_self_then_external_unblock_resumes_exactly_once() {
        let engine = Engine::new();
        let resumed = Rc::new(Cell::new(0));
        let resumed_in_task = resumed.clone();

        let id = engine.start(move |handle| async move {
            handle.block_self().await;
            resumed_in_task.set(resumed_in_task.get() + 1);
        });

        // The blocked coroutine's first poll runs until block_self parks
        // it; nothing else is alive, so the engine has no more work.
        assert!(engine.run_one());
        assert!(!engine.run_one());
        assert_eq!(engine.blocked_count(), 1);
        assert_eq!(resumed.get(), 0);

        engine.unblock(id);
        engine.run_until_idle();

        assert_eq!(resumed.get(), 1);
        assert_eq!(engine.alive_count(), 0);
        assert_eq!(engine.blocked_count(), 0);
    }

    #[test]
    fn sched_to_a_blocked_or_current_target_is_a_no_op() {
        let engine = Engine::new();
        let observed = Rc::new(Cell::new(false));
        let observed_task = observed.clone();

        let blocked_holder: Rc<RefCell<Option<CoroId>>> = Rc::new(RefCell::new(None));
        let blocked_holder_task = blocked_holder.clone();

        engine.start(move |handle| async move {
            let blocked = blocked_holder_task.borrow().unwrap();
            // sched to a blocked coroutine must not switch away.
            handle.sched(Some(blocked)).await;
            observed_task.set(true);
        });

        let blocked_id = engine.start(|handle| async move {
            handle.block_self().await;
        });
        *blocked_holder.borrow_mut() = Some(blocked_id);
        engine.block(blocked_id);

        engine.run_until_idle();

        assert!(observed.get());
    }

    #[test]
    fn large_stack_local_array_survives_a_suspension_point() {
        // Demonstrates the correctness advantage of the REDESIGN: locals
        // live inside the compiler-generated future state, so there is no
        // manual stack-copy step that could corrupt them.
        let engine = Engine::new();
        let ok = Rc::new(Cell::new(false));
        let ok_task = ok.clone();

        engine.start(move |handle| async move {
            let mut array = [0u8; 64 * 1024];
            for (i, byte) in array.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
            handle.yield_now().await;
            let intact = array.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8);
            ok_task.set(intact);
        });

        engine.run_until_idle();
        assert!(ok.get());
    }
}
