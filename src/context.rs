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

//! The fiber control block.
//!
//! A worker control block lives at an aligned reservation at the top of the
//! fiber's own stack; destroying it releases the stack, which is why
//! destruction is always deferred to a scheduler iteration running on some
//! other stack. The main control block borrows the thread's native stack
//! and is boxed instead.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use hashlink::LinkedHashMap;
use intrusive_collections::{LinkedListLink, RBTreeLink};
use parking_lot::Mutex;

use crate::cpu;
use crate::error::SpawnError;
use crate::queues::WaitList;
use crate::scheduler::Scheduler;
use crate::stack::{StackAllocator, StackContext};

/// Control block alignment inside the stack reservation.
const CONTROL_BLOCK_ALIGN: usize = 64;

/// Headroom a worker must keep below its control block.
const MIN_FRAME_ROOM: usize = 4 * 1024;

pub(crate) const FLAG_MAIN: u8 = 1 << 0;
pub(crate) const FLAG_DISPATCHER: u8 = 1 << 1;
pub(crate) const FLAG_WORKER: u8 = 1 << 2;
const FLAG_TERMINATED: u8 = 1 << 3;
const FLAG_INTERRUPTION_BLOCKED: u8 = 1 << 4;
const FLAG_INTERRUPTION_REQUESTED: u8 = 1 << 5;
const FLAG_FORCED_UNWIND: u8 = 1 << 6;

/// One-shot rescheduling-rights word.
///
/// A fiber arms it right before parking in a sleep or wait queue; whichever
/// waker wins the exchange owns the single transition back to ready and
/// leaves the wake reason behind for `wait_until` to report. This is what
/// keeps two threads from resuming the same context.
const RIGHTS_RUNNABLE: u8 = 0;
const RIGHTS_SUSPENDED: u8 = 1;
const RIGHTS_WOKEN_BY_TIMER: u8 = 2;
const RIGHTS_WOKEN_BY_NOTIFY: u8 = 3;

/// Why a suspended fiber was made ready again.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum WakeReason {
    Timer,
    Notify,
}

/// Sleep-set key: a steady-clock wake deadline, `None` meaning never.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct WakeTime(pub Option<Instant>);

impl WakeTime {
    pub const NEVER: WakeTime = WakeTime(None);

    pub fn expired(&self, now: Instant) -> bool {
        match self.0 {
            Some(tp) => tp <= now,
            None => false,
        }
    }
}

impl PartialOrd for WakeTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WakeTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    }
}

/// Cleanup hook for one fiber-local slot.
pub(crate) type FlsCleanup = unsafe fn(*mut u8);

struct FlsData {
    data: *mut u8,
    cleanup: Option<FlsCleanup>,
}

impl FlsData {
    unsafe fn run_cleanup(&self) {
        if let Some(cleanup) = self.cleanup {
            cleanup(self.data);
        }
    }
}

/// Per-fiber runtime record.
///
/// Mutable fields fall into three buckets: atomics readable from foreign
/// threads (flags, rights, use count, owning scheduler), the wait list
/// guarded by its mutex, and owner-thread-only state behind `UnsafeCell`
/// (saved registers, wake time, entry closure, FLS map). The intrusive
/// links are manipulated exclusively by the scheduler that currently owns
/// the context.
pub(crate) struct Context {
    flags: AtomicU8,
    rights: AtomicU8,
    use_count: AtomicUsize,
    scheduler: AtomicPtr<Scheduler>,

    regs: UnsafeCell<cpu::RegisterFile>,
    tp: UnsafeCell<WakeTime>,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,
    stack: UnsafeCell<Option<(StackContext, Box<dyn StackAllocator>)>>,
    fls: UnsafeCell<LinkedHashMap<usize, FlsData>>,

    /// Fibers blocked joining this one.
    wait_queue: Mutex<WaitList>,

    pub(crate) ready_link: LinkedListLink,
    pub(crate) sleep_link: RBTreeLink,
    pub(crate) terminated_link: LinkedListLink,
    pub(crate) worker_link: LinkedListLink,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    fn empty(flags: u8) -> Context {
        Context {
            flags: AtomicU8::new(flags),
            rights: AtomicU8::new(RIGHTS_RUNNABLE),
            use_count: AtomicUsize::new(1),
            scheduler: AtomicPtr::new(ptr::null_mut()),
            regs: UnsafeCell::new(cpu::RegisterFile::new()),
            tp: UnsafeCell::new(WakeTime::NEVER),
            entry: UnsafeCell::new(None),
            stack: UnsafeCell::new(None),
            fls: UnsafeCell::new(LinkedHashMap::new()),
            wait_queue: Mutex::new(WaitList::new()),
            ready_link: LinkedListLink::new(),
            sleep_link: RBTreeLink::new(),
            terminated_link: LinkedListLink::new(),
            worker_link: LinkedListLink::new(),
        }
    }

    /// Synthesizes the main context from the current thread's running
    /// stack. Its register file is filled in by the first switch away.
    pub(crate) fn new_main() -> ContextRef {
        let boxed = Box::new(Context::empty(FLAG_MAIN));
        unsafe { ContextRef::from_raw(Box::into_raw(boxed)) }
    }

    /// Allocates a stack, places the control block at its top and primes
    /// the machine frame so the first resume enters the trampoline.
    pub(crate) fn new_worker(
        kind: u8,
        allocator: Box<dyn StackAllocator>,
        entry: Box<dyn FnOnce()>,
    ) -> Result<ContextRef, SpawnError> {
        debug_assert!(kind == FLAG_WORKER || kind == FLAG_DISPATCHER);
        let sctx = allocator.allocate()?;

        let top = sctx.base as usize;
        let cb = match top.checked_sub(mem::size_of::<Context>()) {
            Some(cb) => cb & !(CONTROL_BLOCK_ALIGN - 1),
            None => {
                unsafe { allocator.deallocate(&sctx) };
                return Err(SpawnError::StackTooSmall);
            }
        };
        let limit = top - sctx.size;
        if cb <= limit || cb - limit < MIN_FRAME_ROOM {
            unsafe { allocator.deallocate(&sctx) };
            return Err(SpawnError::StackTooSmall);
        }

        let ptr = cb as *mut Context;
        unsafe {
            ptr::write(ptr, Context::empty(kind));
            (*(*ptr).entry.get()) = Some(entry);
            (*(*ptr).stack.get()) = Some((sctx, allocator));
            // The machine stack starts right below the control block.
            cpu::prepare(
                &mut *(*ptr).regs.get(),
                cb as *mut u8,
                fiber_trampoline,
                ptr as *mut u8,
            );
            Ok(ContextRef::from_raw(ptr))
        }
    }

    pub(crate) fn id(&self) -> usize {
        self as *const Context as usize
    }

    pub(crate) fn regs(&self) -> *mut cpu::RegisterFile {
        self.regs.get()
    }

    fn flag_is_set(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn update_flag(&self, flag: u8, enable: bool) {
        if enable {
            self.flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    pub(crate) fn is_main(&self) -> bool {
        self.flag_is_set(FLAG_MAIN)
    }

    pub(crate) fn is_dispatcher(&self) -> bool {
        self.flag_is_set(FLAG_DISPATCHER)
    }

    pub(crate) fn is_worker(&self) -> bool {
        self.flag_is_set(FLAG_WORKER)
    }

    /// Pinned contexts never migrate between schedulers.
    pub(crate) fn is_pinned(&self) -> bool {
        !self.is_worker()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.flag_is_set(FLAG_TERMINATED)
    }

    pub(crate) fn set_terminated(&self) {
        self.update_flag(FLAG_TERMINATED, true);
    }

    pub(crate) fn interruption_blocked(&self) -> bool {
        self.flag_is_set(FLAG_INTERRUPTION_BLOCKED)
    }

    pub(crate) fn block_interruption(&self, block: bool) {
        self.update_flag(FLAG_INTERRUPTION_BLOCKED, block);
    }

    pub(crate) fn interruption_requested(&self) -> bool {
        self.flag_is_set(FLAG_INTERRUPTION_REQUESTED)
    }

    pub(crate) fn request_interruption(&self, req: bool) {
        self.update_flag(FLAG_INTERRUPTION_REQUESTED, req);
    }

    pub(crate) fn clear_interruption_request(&self) {
        self.update_flag(FLAG_INTERRUPTION_REQUESTED, false);
    }

    pub(crate) fn unwinding_requested(&self) -> bool {
        self.flag_is_set(FLAG_FORCED_UNWIND)
    }

    pub(crate) fn request_unwinding(&self) {
        self.update_flag(FLAG_FORCED_UNWIND, true);
    }

    pub(crate) fn set_scheduler(&self, sched: *mut Scheduler) {
        self.scheduler.store(sched, Ordering::Release);
    }

    pub(crate) fn scheduler_ptr(&self) -> *mut Scheduler {
        self.scheduler.load(Ordering::Acquire)
    }

    pub(crate) fn wake_time(&self) -> WakeTime {
        unsafe { *self.tp.get() }
    }

    pub(crate) fn set_wake_time(&self, tp: WakeTime) {
        unsafe { *self.tp.get() = tp }
    }

    /// Arms the rights word; must precede publishing the context in any
    /// sleep or wait queue.
    pub(crate) fn arm_suspend(&self) {
        self.rights.store(RIGHTS_SUSPENDED, Ordering::Release);
    }

    /// Claims the single suspended→ready transition. Exactly one caller
    /// per suspension succeeds.
    pub(crate) fn acquire_rescheduling_rights(&self, reason: WakeReason) -> bool {
        let claimed = match reason {
            WakeReason::Timer => RIGHTS_WOKEN_BY_TIMER,
            WakeReason::Notify => RIGHTS_WOKEN_BY_NOTIFY,
        };
        self.rights
            .compare_exchange(
                RIGHTS_SUSPENDED,
                claimed,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reads and resets the wake reason after the fiber resumed.
    pub(crate) fn take_wake_reason(&self) -> Option<WakeReason> {
        match self.rights.swap(RIGHTS_RUNNABLE, Ordering::AcqRel) {
            RIGHTS_WOKEN_BY_TIMER => Some(WakeReason::Timer),
            RIGHTS_WOKEN_BY_NOTIFY => Some(WakeReason::Notify),
            _ => None,
        }
    }

    /// Links `active` into this context's wait queue unless this context
    /// already terminated. Returns whether the caller is now waiting; the
    /// caller itself performs the suspend.
    pub(crate) fn join_wait(&self, active: &Context) -> bool {
        let mut wq = self.wait_queue.lock();
        if self.is_terminated() {
            return false;
        }
        active.arm_suspend();
        wq.push(active);
        true
    }

    /// Removes a joiner that was woken by something other than this
    /// context's termination (interruption, forced unwind).
    pub(crate) fn wait_unlink(&self, waiter: &Context) {
        self.wait_queue.lock().remove(waiter);
    }

    /// Terminal bookkeeping: drains the wait list, marking each joiner
    /// ready, then runs every FLS cleanup. Runs on the terminating fiber
    /// itself, before its final suspend.
    pub(crate) fn release(&self) {
        debug_assert!(self.is_terminated());
        let waiters = {
            let mut wq = self.wait_queue.lock();
            wq.drain()
        };
        for waiter in waiters {
            Scheduler::set_ready(waiter, WakeReason::Notify);
        }
        let fls = unsafe { mem::take(&mut *self.fls.get()) };
        for (_, data) in fls {
            unsafe { data.run_cleanup() };
        }
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce()>> {
        unsafe { (*self.entry.get()).take() }
    }

    /// Looks up a fiber-local slot. Only the owning fiber may call this.
    pub(crate) fn get_fls(&self, key: usize) -> *mut u8 {
        let map = unsafe { &*self.fls.get() };
        map.get(&key).map_or(ptr::null_mut(), |d| d.data)
    }

    /// Installs, replaces or removes a fiber-local slot. A null `data`
    /// removes the entry. Only the owning fiber may call this.
    pub(crate) fn set_fls(
        &self,
        key: usize,
        cleanup: Option<FlsCleanup>,
        data: *mut u8,
        cleanup_existing: bool,
    ) {
        let map = unsafe { &mut *self.fls.get() };
        if let Some(existing) = map.get(&key) {
            if cleanup_existing {
                unsafe { existing.run_cleanup() };
            }
            if data.is_null() {
                map.remove(&key);
                return;
            }
        } else if data.is_null() {
            return;
        }
        map.insert(key, FlsData { data, cleanup });
    }

    pub(crate) fn use_count(&self) -> usize {
        self.use_count.load(Ordering::Acquire)
    }
}

/// Entry point of every worker and dispatcher context, running on the
/// fiber's own stack.
extern "C" fn fiber_trampoline(arg: *mut u8) -> ! {
    let ctx = unsafe { &*(arg as *const Context) };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // A context force-unwound before ever running skips its entry.
        if !ctx.unwinding_requested() {
            if let Some(entry) = ctx.take_entry() {
                entry();
            }
        }
    }));

    if let Err(payload) = result {
        let benign = payload.downcast_ref::<crate::error::Interrupted>().is_some()
            || payload.downcast_ref::<crate::error::ForcedUnwind>().is_some();
        if !benign {
            // Letting an arbitrary failure escape into the scheduler would
            // corrupt queue invariants; the contract is to die loudly.
            log::error!("fiber {:#x} panicked; aborting process", ctx.id());
            std::process::abort();
        }
    }

    Scheduler::terminate_active();
}

/// Intrusive reference-counted handle to a [`Context`].
///
/// Cloning bumps the count; dropping the last one destroys the control
/// block in place and releases its stack. The scheduler's terminated-queue
/// deferral guarantees the last drop never happens on the context's own
/// stack.
pub(crate) struct ContextRef {
    ptr: NonNull<Context>,
}

unsafe impl Send for ContextRef {}
unsafe impl Sync for ContextRef {}

impl ContextRef {
    /// Takes over one reference that is already counted.
    pub(crate) unsafe fn from_raw(ptr: *const Context) -> ContextRef {
        ContextRef {
            ptr: NonNull::new_unchecked(ptr as *mut Context),
        }
    }

    /// Creates a new counted reference from a borrowed pointer.
    pub(crate) unsafe fn clone_from_raw(ptr: *const Context) -> ContextRef {
        (*ptr).use_count.fetch_add(1, Ordering::Relaxed);
        ContextRef::from_raw(ptr)
    }

    /// Leaks this reference's count to the caller.
    pub(crate) fn into_raw(this: ContextRef) -> *const Context {
        let ptr = this.ptr.as_ptr();
        mem::forget(this);
        ptr
    }

    pub(crate) fn as_ptr(&self) -> *const Context {
        self.ptr.as_ptr()
    }
}

impl std::ops::Deref for ContextRef {
    type Target = Context;

    fn deref(&self) -> &Context {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> ContextRef {
        unsafe { self.ptr.as_ref() }
            .use_count
            .fetch_add(1, Ordering::Relaxed);
        ContextRef { ptr: self.ptr }
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        let ctx = unsafe { self.ptr.as_ref() };
        if ctx.use_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe { destroy(self.ptr.as_ptr()) };
        }
    }
}

impl PartialEq for ContextRef {
    fn eq(&self, other: &ContextRef) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for ContextRef {}

/// Destroys a control block whose reference count reached zero.
///
/// Worker and dispatcher blocks sit on their own stacks: the stack region
/// and its allocator are moved out first, the block is dropped in place and
/// the stack is released last. Never runs on the stack being released.
unsafe fn destroy(ptr: *mut Context) {
    if (*ptr).is_main() {
        drop(Box::from_raw(ptr));
        return;
    }
    debug_assert!((*ptr).is_worker() || (*ptr).is_dispatcher());
    debug_assert!((*ptr).is_terminated());
    debug_assert!(!(*ptr).ready_link.is_linked());
    debug_assert!(!(*ptr).sleep_link.is_linked());
    let (sctx, allocator) = (*(*ptr).stack.get())
        .take()
        .expect("worker context without a stack");
    ptr::drop_in_place(ptr);
    allocator.deallocate(&sctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::FixedSizeStack;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn worker(entry: Box<dyn FnOnce()>) -> ContextRef {
        Context::new_worker(FLAG_WORKER, Box::new(FixedSizeStack::default()), entry).unwrap()
    }

    #[test]
    fn test_flags_start_from_kind() {
        let ctx = worker(Box::new(|| {}));
        assert!(ctx.is_worker());
        assert!(!ctx.is_pinned());
        assert!(!ctx.is_terminated());
        assert!(!ctx.interruption_requested());
        ctx.set_terminated();
        assert!(ctx.is_terminated());
    }

    #[test]
    fn test_rights_claimed_once() {
        let ctx = worker(Box::new(|| {}));
        ctx.arm_suspend();
        assert!(ctx.acquire_rescheduling_rights(WakeReason::Timer));
        assert!(!ctx.acquire_rescheduling_rights(WakeReason::Notify));
        assert_eq!(ctx.take_wake_reason(), Some(WakeReason::Timer));
        assert_eq!(ctx.take_wake_reason(), None);
        ctx.set_terminated();
    }

    #[test]
    fn test_wake_time_ordering() {
        let now = Instant::now();
        let early = WakeTime(Some(now));
        let late = WakeTime(Some(now + Duration::from_millis(5)));
        assert!(early < late);
        assert!(late < WakeTime::NEVER);
        assert!(!WakeTime::NEVER.expired(now + Duration::from_secs(3600)));
        assert!(early.expired(now));
        assert!(!late.expired(now));
    }

    static REPLACE_CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn replace_cleanup(_data: *mut u8) {
        REPLACE_CLEANUPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_fls_replace_and_remove() {
        let ctx = worker(Box::new(|| {}));
        let key = 0x1000;
        let mut a = 1u8;
        let mut b = 2u8;

        assert!(ctx.get_fls(key).is_null());
        ctx.set_fls(key, Some(replace_cleanup), &mut a, false);
        assert_eq!(ctx.get_fls(key), &mut a as *mut u8);

        // Replace, running the old cleanup.
        ctx.set_fls(key, Some(replace_cleanup), &mut b, true);
        assert_eq!(REPLACE_CLEANUPS.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.get_fls(key), &mut b as *mut u8);

        // Remove without running the cleanup.
        ctx.set_fls(key, None, ptr::null_mut(), false);
        assert!(ctx.get_fls(key).is_null());
        assert_eq!(REPLACE_CLEANUPS.load(Ordering::SeqCst), 1);
        ctx.set_terminated();
    }

    static RELEASE_CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn release_cleanup(_data: *mut u8) {
        RELEASE_CLEANUPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_release_runs_remaining_cleanups() {
        let ctx = worker(Box::new(|| {}));
        let mut a = 1u8;
        ctx.set_fls(0x2000, Some(release_cleanup), &mut a, false);
        ctx.set_terminated();
        ctx.release();
        assert_eq!(RELEASE_CLEANUPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refcount_reaches_zero_releases_stack() {
        let ctx = worker(Box::new(|| {}));
        assert_eq!(ctx.use_count(), 1);
        let extra = ctx.clone();
        assert_eq!(ctx.use_count(), 2);
        drop(extra);
        assert_eq!(ctx.use_count(), 1);
        ctx.set_terminated();
        drop(ctx); // destroys in place, releases the stack
    }

    #[test]
    fn test_join_wait_fast_path_on_terminated() {
        let target = worker(Box::new(|| {}));
        let joiner = worker(Box::new(|| {}));
        target.set_terminated();
        assert!(!target.join_wait(&joiner));
        joiner.set_terminated();
    }
}
