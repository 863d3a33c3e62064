//! The public fiber handle and the operations a running fiber applies to
//! itself.

use std::fmt;
use std::time::{Duration, Instant};

use crate::algo::Algorithm;
use crate::context::{WakeReason, WakeTime};
use crate::error::{JoinError, SpawnError};
use crate::scheduler::{deliver_interruption, Reactor, Scheduler};
use crate::stack::{ProtectedFixedSizeStack, StackAllocator};

/// Opaque fiber identity, ordered and hashable, derived from the control
/// block address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FiberId(usize);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Move-only owner of one worker fiber.
///
/// Dropping the handle detaches: the fiber keeps running and its resources
/// are reclaimed when it terminates.
pub struct Fiber {
    ctx: Option<crate::context::ContextRef>,
}

impl Fiber {
    /// Spawns a fiber with the default guarded stack and registers it with
    /// the current thread's scheduler.
    pub fn spawn<F>(f: F) -> Result<Fiber, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::spawn_with_stack(ProtectedFixedSizeStack::default(), f)
    }

    /// Spawns a fiber on a stack from the given allocator.
    pub fn spawn_with_stack<A, F>(allocator: A, f: F) -> Result<Fiber, SpawnError>
    where
        A: StackAllocator + 'static,
        F: FnOnce() + Send + 'static,
    {
        let ctx = Scheduler::current().spawn(Box::new(allocator), Box::new(f))?;
        Ok(Fiber { ctx: Some(ctx) })
    }

    /// Blocks the calling fiber until this fiber terminates. Interruption
    /// point.
    pub fn join(mut self) -> Result<(), JoinError> {
        let ctx = self.ctx.take().expect("fiber handle already consumed");
        Scheduler::current().join(&ctx)
    }

    /// Releases the handle without waiting.
    pub fn detach(mut self) {
        self.ctx.take();
    }

    /// Requests cooperative interruption: the fiber observes it at its
    /// next interruption point. Wakes the fiber if it is blocked.
    pub fn interrupt(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.request_interruption(true);
            Scheduler::set_ready(ctx.clone(), WakeReason::Notify);
        }
    }

    pub fn id(&self) -> FiberId {
        FiberId(self.ctx.as_ref().map_or(0, |ctx| ctx.id()))
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id()).finish()
    }
}

/// Identity of the calling fiber; the main flow of control counts as a
/// fiber too.
pub fn current_id() -> FiberId {
    FiberId(Scheduler::current().active_context().id())
}

/// Reschedules the calling fiber behind the rest of the ready set. Not an
/// interruption point.
pub fn yield_now() {
    Scheduler::current().yield_active();
}

/// Puts the calling fiber to sleep until `deadline`. Interruption point.
/// Returns `true` if the wake was the deadline passing rather than an
/// external wake.
pub fn sleep_until(deadline: Instant) -> bool {
    Scheduler::current().wait_until(WakeTime(Some(deadline)))
}

/// Puts the calling fiber to sleep for `duration`. Interruption point.
pub fn sleep_for(duration: Duration) -> bool {
    sleep_until(Instant::now() + duration)
}

/// Delivers a pending interruption, if any. The sentinel unwinds the fiber
/// unless caught.
pub fn interruption_point() {
    deliver_interruption(Scheduler::current().active_context());
}

/// Whether an interruption is pending for the calling fiber.
pub fn is_interruption_requested() -> bool {
    Scheduler::current().active_context().interruption_requested()
}

/// Defers interruption delivery for the calling fiber while alive.
pub struct DisableInterruption {
    was_blocked: bool,
}

impl DisableInterruption {
    pub fn new() -> DisableInterruption {
        let ctx = Scheduler::current().active_context();
        let was_blocked = ctx.interruption_blocked();
        ctx.block_interruption(true);
        DisableInterruption { was_blocked }
    }
}

impl Default for DisableInterruption {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableInterruption {
    fn drop(&mut self) {
        Scheduler::current()
            .active_context()
            .block_interruption(self.was_blocked);
    }
}

/// Installs a scheduling policy for the current thread. Must be called
/// before the first fiber is spawned here.
pub fn use_scheduling_algorithm<A: Algorithm + 'static>(algo: A) {
    Scheduler::current().replace_algorithm(Box::new(algo));
}

/// Sets the current thread scheduler's wait tick: the upper bound on wake
/// latency when it parks without a better deadline.
pub fn set_wait_interval(interval: Duration) {
    Scheduler::current().set_wait_interval(interval);
}

/// Installs an I/O reactor hook consulted in place of the policy's park.
pub fn set_reactor<R: Reactor + 'static>(reactor: R) {
    Scheduler::current().set_reactor(Box::new(reactor));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_spawn_join_runs_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let fiber = Fiber::spawn(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        fiber.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_join_after_termination_returns_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let fiber = Fiber::spawn(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        // Let the fiber run to completion before joining.
        while !ran.load(Ordering::SeqCst) {
            yield_now();
        }
        fiber.join().unwrap();
    }

    #[test]
    fn test_join_self_is_a_deadlock_error() {
        let slot: Arc<Mutex<Option<Fiber>>> = Arc::new(Mutex::new(None));
        let shared = slot.clone();
        let saw_deadlock = Arc::new(AtomicBool::new(false));
        let witness = saw_deadlock.clone();
        let fiber = Fiber::spawn(move || {
            let me = shared.lock().unwrap().take().unwrap();
            if me.join() == Err(JoinError::Deadlock) {
                witness.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        let id = fiber.id();
        *slot.lock().unwrap() = Some(fiber);
        while !saw_deadlock.load(Ordering::SeqCst) {
            yield_now();
        }
        assert_ne!(id, FiberId(0));
    }

    #[test]
    fn test_detached_fiber_still_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        Fiber::spawn(move || {
            yield_now();
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap()
        .detach();
        while !ran.load(Ordering::SeqCst) {
            yield_now();
        }
    }

    #[test]
    fn test_fiber_ids_are_distinct_and_display() {
        let a = Fiber::spawn(|| {}).unwrap();
        let b = Fiber::spawn(|| {}).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("0x"));
        a.join().unwrap();
        b.join().unwrap();
    }

    #[test]
    fn test_interrupt_wakes_blocked_fiber() {
        // A fiber parked on a far-away deadline is delivered the sentinel
        // at the blocking point and terminates cleanly.
        let past_sleep = Arc::new(AtomicBool::new(false));
        let marker = past_sleep.clone();
        let started = Arc::new(AtomicBool::new(false));
        let started_flag = started.clone();
        let fiber = Fiber::spawn(move || {
            started_flag.store(true, Ordering::SeqCst);
            sleep_for(Duration::from_secs(3600));
            marker.store(true, Ordering::SeqCst);
        })
        .unwrap();
        while !started.load(Ordering::SeqCst) {
            yield_now();
        }
        let begin = Instant::now();
        fiber.interrupt();
        fiber.join().unwrap();
        assert!(!past_sleep.load(Ordering::SeqCst));
        assert!(begin.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_blocked_interruption_is_deferred() {
        let stage = Arc::new(AtomicUsize::new(0));
        let observed = stage.clone();
        let fiber = Fiber::spawn(move || {
            let guard = DisableInterruption::new();
            observed.store(1, Ordering::SeqCst);
            // Woken early by the interrupt, but the sentinel must not be
            // delivered while blocked.
            sleep_for(Duration::from_secs(3600));
            observed.store(2, Ordering::SeqCst);
            drop(guard);
            interruption_point();
            observed.store(3, Ordering::SeqCst);
        })
        .unwrap();
        while stage.load(Ordering::SeqCst) < 1 {
            yield_now();
        }
        fiber.interrupt();
        fiber.join().unwrap();
        assert_eq!(stage.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interruption_flag_visible_before_delivery() {
        let seen = Arc::new(AtomicBool::new(false));
        let witness = seen.clone();
        let fiber = Fiber::spawn(move || {
            while !is_interruption_requested() {
                yield_now();
            }
            witness.store(true, Ordering::SeqCst);
            // Yield is not an interruption point; running on is fine.
            yield_now();
        })
        .unwrap();
        fiber.interrupt();
        fiber.join().unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
