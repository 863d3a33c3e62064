/*
*   Copyright (c) 2020 Adel Prokurov
*   All rights reserved.

*   Licensed under the Apache License, Version 2.0 (the "License");
*   you may not use this file except in compliance with the License.
*   You may obtain a copy of the License at

*   http://www.apache.org/licenses/LICENSE-2.0

*   Unless required by applicable law or agreed to in writing, software
*   distributed under the License is distributed on an "AS IS" BASIS,
*   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*   See the License for the specific language governing permissions and
*   limitations under the License.
*/

//! The per-thread fiber scheduler.
//!
//! Every thread that runs fibers owns exactly one `Scheduler`, created
//! lazily on the first fiber operation and torn down when the thread
//! exits. The event loop runs on a dedicated dispatcher context: every
//! suspension switches there, the dispatcher picks the next runnable
//! context and switches to it. Terminated contexts are destroyed by the
//! dispatcher one loop trip after they finish, never on their own stack.

use std::cell::{Cell, UnsafeCell};
use std::panic::panic_any;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::algo::{Algorithm, ReadyContext, RoundRobin};
use crate::context::{Context, ContextRef, WakeReason, WakeTime, FLAG_DISPATCHER, FLAG_WORKER};
use crate::cpu;
use crate::error::{ForcedUnwind, Interrupted, SpawnError};
use crate::queues::{SleepSet, TerminatedList, WorkerList};
use crate::stack::{ProtectedFixedSizeStack, StackAllocator};

/// Upper bound on wake latency when the scheduler has no deadline to park
/// against and its policy cannot be notified.
const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// The dispatcher runs only the scheduling loop; it needs little room.
const DISPATCHER_STACK_SIZE: usize = 64 * 1024;

/// Hook for integrating an external I/O reactor: called in place of the
/// policy's `suspend_until` so timed sleeps can be merged with I/O
/// readiness.
pub trait Reactor {
    fn wait(&self, deadline: Option<Instant>);
}

pub(crate) struct Scheduler {
    // Dropped before `main_ctx`; the main context is destroyed last.
    dispatcher_ctx: Option<ContextRef>,
    main_ctx: ContextRef,
    active: Cell<*const Context>,

    algo: UnsafeCell<Box<dyn Algorithm>>,
    sleep_queue: UnsafeCell<SleepSet>,
    terminated_queue: UnsafeCell<TerminatedList>,
    worker_queue: UnsafeCell<WorkerList>,

    /// Hand-off slot for a yielding context, consumed by the dispatcher
    /// after the switch away from it so a migratable context is never
    /// published while still running.
    pending_ready: Cell<Option<ContextRef>>,

    /// Cross-thread ready hand-off. Foreign schedulers push counted
    /// handles here and poke the policy awake; the owner drains at the
    /// top of every loop trip.
    remote_tx: Sender<ContextRef>,
    remote_rx: Receiver<ContextRef>,
    remote_pending: AtomicUsize,

    shutdown: Cell<bool>,
    wait_interval: Cell<Duration>,
    reactor: UnsafeCell<Option<Box<dyn Reactor>>>,
}

// Foreign threads touch only `remote_tx`/`remote_pending` and
// `Algorithm::notify`; everything else is owner-thread state reached
// through the thread-local pointer.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

thread_local! {
    /// Raw pointer to this thread's scheduler. Plain cell without a
    /// destructor so it stays readable while other thread-locals unwind.
    static SCHED_PTR: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };

    /// Owns the scheduler box; its destructor drives the shutdown drain.
    static SCHED_OWNER: SchedulerOwner = const { SchedulerOwner(UnsafeCell::new(None)) };
}

struct SchedulerOwner(UnsafeCell<Option<Box<Scheduler>>>);

impl Drop for SchedulerOwner {
    fn drop(&mut self) {
        if let Some(sched) = unsafe { &mut *self.0.get() }.take() {
            sched.shutdown();
            let _ = SCHED_PTR.try_with(|c| c.set(ptr::null_mut()));
            drop(sched);
        }
    }
}

impl Scheduler {
    /// This thread's scheduler, created on first use.
    pub(crate) fn current<'a>() -> &'a Scheduler {
        let ptr = SCHED_PTR.with(|c| c.get());
        if !ptr.is_null() {
            return unsafe { &*ptr };
        }
        Scheduler::init()
    }

    fn init<'a>() -> &'a Scheduler {
        let (remote_tx, remote_rx) = unbounded();
        let mut boxed = Box::new(Scheduler {
            dispatcher_ctx: None,
            main_ctx: Context::new_main(),
            active: Cell::new(ptr::null()),
            algo: UnsafeCell::new(Box::new(RoundRobin::new())),
            sleep_queue: UnsafeCell::new(SleepSet::new()),
            terminated_queue: UnsafeCell::new(TerminatedList::new()),
            worker_queue: UnsafeCell::new(WorkerList::new()),
            pending_ready: Cell::new(None),
            remote_tx,
            remote_rx,
            remote_pending: AtomicUsize::new(0),
            shutdown: Cell::new(false),
            wait_interval: Cell::new(DEFAULT_WAIT_INTERVAL),
            reactor: UnsafeCell::new(None),
        });

        let sched = &mut *boxed as *mut Scheduler;
        let dispatcher = Context::new_worker(
            FLAG_DISPATCHER,
            Box::new(ProtectedFixedSizeStack::new(DISPATCHER_STACK_SIZE)),
            Box::new(move || unsafe { (*sched).dispatch() }),
        )
        .expect("failed to allocate the dispatcher stack");
        dispatcher.set_scheduler(sched);
        boxed.main_ctx.set_scheduler(sched);
        boxed.active.set(boxed.main_ctx.as_ptr());
        boxed.dispatcher_ctx = Some(dispatcher);

        log::debug!("scheduler {:p} installed on {:?}", sched, std::thread::current().id());
        SCHED_PTR.with(|c| c.set(sched));
        SCHED_OWNER.with(|o| unsafe { *o.0.get() = Some(boxed) });
        unsafe { &*sched }
    }

    fn algo(&self) -> &dyn Algorithm {
        unsafe { &**self.algo.get() }
    }

    fn dispatcher(&self) -> &Context {
        self.dispatcher_ctx
            .as_deref()
            .expect("dispatcher not yet created")
    }

    pub(crate) fn active_context(&self) -> &Context {
        unsafe { &*self.active.get() }
    }

    /// Installs a different scheduling policy. Must happen before any
    /// fiber is spawned on this thread.
    pub(crate) fn replace_algorithm(&self, algo: Box<dyn Algorithm>) {
        assert!(
            unsafe { &*self.worker_queue.get() }.is_empty() && !self.algo().has_ready(),
            "scheduling policy must be installed before spawning fibers"
        );
        unsafe { *self.algo.get() = algo };
    }

    pub(crate) fn set_wait_interval(&self, interval: Duration) {
        self.wait_interval.set(interval);
    }

    pub(crate) fn set_reactor(&self, reactor: Box<dyn Reactor>) {
        unsafe { *self.reactor.get() = Some(reactor) };
    }

    /// Spawns a worker: places the control block, registers it with this
    /// scheduler and hands it to the policy.
    pub(crate) fn spawn(
        &self,
        allocator: Box<dyn StackAllocator>,
        entry: Box<dyn FnOnce()>,
    ) -> Result<ContextRef, SpawnError> {
        let ctx = Context::new_worker(FLAG_WORKER, allocator, entry)?;
        self.attach_worker(&ctx);
        log::debug!("spawned fiber {:#x}", ctx.id());
        self.algo().awakened(ReadyContext(ctx.clone()));
        Ok(ctx)
    }

    /// Links a context into this scheduler's worker list, taking
    /// ownership. Called at spawn and when the policy adopts a stolen
    /// context.
    pub(crate) fn attach_worker(&self, ctx: &Context) {
        ctx.set_scheduler(self as *const Scheduler as *mut Scheduler);
        unsafe { &mut *self.worker_queue.get() }
            .push(unsafe { ContextRef::clone_from_raw(ctx as *const Context) });
    }

    /// Unlinks a context from the worker list, clearing its back-pointer
    /// and handing the owning reference to the caller. This is what makes
    /// the context eligible for a thief.
    pub(crate) fn detach_worker(&self, ctx: &Context) -> Option<ContextRef> {
        ctx.set_scheduler(ptr::null_mut());
        unsafe { &mut *self.worker_queue.get() }.unlink(ctx)
    }

    /// Wakes a suspended context from any thread. Exactly one waker per
    /// suspension gets through; the rest are no-ops.
    pub(crate) fn set_ready(ctx: ContextRef, reason: WakeReason) {
        if !ctx.acquire_rescheduling_rights(reason) {
            return;
        }
        let owner = ctx.scheduler_ptr();
        debug_assert!(!owner.is_null(), "suspended context without a scheduler");
        let current = SCHED_PTR.try_with(|c| c.get()).unwrap_or(ptr::null_mut());
        if owner == current {
            unsafe { (*owner).set_ready_local(ctx) };
        } else {
            unsafe { (*owner).remote_ready(ctx) };
        }
    }

    /// Owner-thread completion of a wake: unlink from the sleep set if
    /// linked, then hand to the policy.
    fn set_ready_local(&self, ctx: ContextRef) {
        unsafe { &mut *self.sleep_queue.get() }.unlink(&ctx);
        self.algo().awakened(ReadyContext(ctx));
    }

    /// Foreign-thread path: enqueue onto the owner's remote-ready channel
    /// and poke its policy awake.
    fn remote_ready(&self, ctx: ContextRef) {
        self.remote_pending.fetch_add(1, Ordering::Release);
        self.remote_tx
            .send(ctx)
            .expect("remote-ready channel closed");
        self.algo().notify();
    }

    fn drain_remote(&self) {
        let pending = self.remote_pending.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        let mut received = 0;
        for ctx in self.remote_rx.try_iter().take(pending) {
            received += 1;
            self.set_ready_local(ctx);
        }
        self.remote_pending.fetch_sub(received, Ordering::Release);
    }

    /// Switches from the dispatcher into `ctx`; returns when `ctx`
    /// suspends again.
    fn resume(&self, ctx: &Context) {
        debug_assert!(!ctx.is_terminated(), "resume of a terminated context");
        self.active.set(ctx as *const Context);
        unsafe { cpu::switch(self.dispatcher().regs(), ctx.regs()) };
        self.active.set(self.dispatcher() as *const Context);
    }

    /// Relinquishes the CPU: switches the active context to the
    /// dispatcher. Returns when this context is next resumed. The caller
    /// must already have arranged its own wakeup (ready slot, sleep set,
    /// wait list) or it will never run again.
    pub(crate) fn suspend_active(&self) {
        let active = self.active.get();
        unsafe { cpu::switch((*active).regs(), self.dispatcher().regs()) };
        // Resumed. Teardown reclaims still-running fibers here.
        let ctx = unsafe { &*active };
        if ctx.unwinding_requested() && !ctx.is_terminated() {
            panic_any(ForcedUnwind);
        }
    }

    /// Re-enqueues the active context and suspends. Not an interruption
    /// point.
    pub(crate) fn yield_active(&self) {
        let active = self.active_context();
        self.pending_ready
            .set(Some(unsafe { ContextRef::clone_from_raw(active as *const Context) }));
        self.suspend_active();
    }

    /// Parks the active context until `tp` (forever when `None`). Returns
    /// whether the wake was the timer rather than an external notify.
    pub(crate) fn wait_until(&self, tp: WakeTime) -> bool {
        let active = self.active_context();
        deliver_interruption(active);
        active.set_wake_time(tp);
        active.arm_suspend();
        unsafe { &mut *self.sleep_queue.get() }.insert(active);
        self.suspend_active();
        active.set_wake_time(WakeTime::NEVER);
        let timed_out = active.take_wake_reason() == Some(WakeReason::Timer);
        deliver_interruption(active);
        timed_out
    }

    /// Blocks the active context until `target` terminates.
    pub(crate) fn join(&self, target: &Context) -> Result<(), crate::error::JoinError> {
        let active = self.active_context();
        if ptr::eq(active as *const Context, target as *const Context) {
            return Err(crate::error::JoinError::Deadlock);
        }
        deliver_interruption(active);
        if target.join_wait(active) {
            self.suspend_active();
            // A wake that was not the target's termination (interruption)
            // leaves us linked; take ourselves out.
            target.wait_unlink(active);
            active.take_wake_reason();
            deliver_interruption(active);
            debug_assert!(target.is_terminated());
        }
        Ok(())
    }

    /// Final act of a finished fiber: mark terminated, wake joiners, run
    /// FLS cleanups, queue for deferred destruction and leave this stack
    /// for good.
    pub(crate) fn terminate_active() -> ! {
        let sched = Scheduler::current();
        let active = sched.active_context();
        log::trace!("fiber {:#x} terminated", active.id());
        active.set_terminated();
        active.release();
        unsafe { &mut *sched.terminated_queue.get() }.push(active);
        sched.suspend_active();
        unreachable!("terminated fiber resumed");
    }

    /// Destroys fibers that finished on an earlier loop trip. Runs on the
    /// dispatcher stack.
    fn clear_terminated(&self) {
        let tqueue = unsafe { &mut *self.terminated_queue.get() };
        while let Some(raw) = tqueue.pop() {
            let ctx = unsafe { &*raw };
            log::trace!("reclaiming fiber {:#x} (refs {})", ctx.id(), ctx.use_count());
            let owned = unsafe { &mut *self.worker_queue.get() }.unlink(ctx);
            // Last reference unless a handle is still alive.
            drop(owned);
        }
    }

    /// The scheduler event loop, running on the dispatcher context.
    fn dispatch(&self) {
        loop {
            if let Some(ctx) = self.pending_ready.take() {
                self.algo().awakened(ReadyContext(ctx));
            }
            self.drain_remote();

            // Move every sleeper whose wake time passed to the policy.
            // The rights exchange loses against a concurrent notify that
            // already claimed the wake.
            let now = Instant::now();
            loop {
                let sleep_queue = unsafe { &mut *self.sleep_queue.get() };
                match sleep_queue.pop_expired(now) {
                    Some(raw) => {
                        let ctx = unsafe { &*raw };
                        if ctx.acquire_rescheduling_rights(WakeReason::Timer) {
                            self.algo()
                                .awakened(ReadyContext(unsafe { ContextRef::clone_from_raw(raw) }));
                        }
                    }
                    None => break,
                }
            }

            if let Some(ready) = self.algo().pick_next() {
                let ctx = ready.into_inner();
                if self.shutdown.get() && ctx.is_worker() {
                    // Teardown: reclaim the fiber instead of running it on.
                    ctx.request_unwinding();
                }
                self.clear_terminated();
                self.resume(&ctx);
                drop(ctx);
                self.clear_terminated();
                continue;
            }

            let workers = unsafe { &*self.worker_queue.get() };
            let terminated = unsafe { &*self.terminated_queue.get() };
            if self.shutdown.get()
                && workers.is_empty()
                && terminated.is_empty()
                && !self.algo().has_ready()
                && self.remote_pending.load(Ordering::Acquire) == 0
            {
                break;
            }

            if self.remote_pending.load(Ordering::Acquire) == 0 && !self.algo().has_ready() {
                // Nearest sleep deadline, capped by the wait tick so wake
                // latency stays bounded even for wakes the policy cannot
                // be notified about.
                let tick = Instant::now() + self.wait_interval.get();
                let deadline = match unsafe { &*self.sleep_queue.get() }.next_deadline() {
                    Some(tp) => tp.min(tick),
                    None => tick,
                };
                match unsafe { &*self.reactor.get() } {
                    Some(reactor) => reactor.wait(Some(deadline)),
                    None => self.algo().suspend_until(Some(deadline)),
                }
            }
        }

        // Only the main context is left; hand the thread back for good.
        debug_assert!(unsafe { &*self.sleep_queue.get() }.is_empty());
        self.dispatcher().set_terminated();
        self.active.set(self.main_ctx.as_ptr());
        unsafe { cpu::switch(self.dispatcher().regs(), self.main_ctx.regs()) };
        unreachable!("dispatcher resumed after shutdown");
    }

    /// Drives teardown from the main context: requests unwinding on every
    /// live worker, then lets the dispatcher drain until only main
    /// remains. Guarantees every stack is released.
    fn shutdown(&self) {
        log::debug!("scheduler {:p} shutting down", self as *const Scheduler);
        self.shutdown.set(true);
        let workers: Vec<ContextRef> = unsafe { &*self.worker_queue.get() }
            .iter()
            .map(|ctx| unsafe { ContextRef::clone_from_raw(ctx as *const Context) })
            .collect();
        for worker in workers {
            worker.request_unwinding();
            Scheduler::set_ready(worker, WakeReason::Notify);
        }
        self.suspend_active();
        debug_assert!(unsafe { &*self.worker_queue.get() }.is_empty());
        // The thread's flow of control ends here as far as fibers are
        // concerned; run the main context's FLS cleanups too.
        self.main_ctx.set_terminated();
        self.main_ctx.release();
    }
}

/// Throws the interruption sentinel if one is pending and deliverable.
pub(crate) fn deliver_interruption(ctx: &Context) {
    if ctx.interruption_requested() && !ctx.interruption_blocked() {
        ctx.clear_interruption_request();
        panic_any(Interrupted);
    }
}
