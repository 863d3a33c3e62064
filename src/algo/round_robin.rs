//! Single-thread FIFO scheduling.

use std::cell::UnsafeCell;
use std::time::Instant;

use super::{Algorithm, ReadyContext};
use crate::queues::ReadyList;

/// Runs ready fibers in arrival order on one thread.
///
/// There is no other thread to wake this policy, so `notify` does nothing
/// and parking is a plain timed sleep; cross-thread wakes are picked up at
/// the scheduler's next tick.
pub struct RoundRobin {
    rqueue: UnsafeCell<ReadyList>,
}

// The queue is touched only by the owning scheduler's thread.
unsafe impl Send for RoundRobin {}
unsafe impl Sync for RoundRobin {}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin {
            rqueue: UnsafeCell::new(ReadyList::new()),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for RoundRobin {
    fn awakened(&self, ctx: ReadyContext) {
        unsafe { &mut *self.rqueue.get() }.push(ctx.0);
    }

    fn pick_next(&self) -> Option<ReadyContext> {
        unsafe { &mut *self.rqueue.get() }.pop().map(ReadyContext)
    }

    fn has_ready(&self) -> bool {
        !unsafe { &*self.rqueue.get() }.is_empty()
    }

    fn suspend_until(&self, deadline: Option<Instant>) {
        let now = Instant::now();
        match deadline {
            Some(tp) if tp > now => std::thread::sleep(tp - now),
            Some(_) => {}
            None => std::thread::yield_now(),
        }
    }

    fn notify(&self) {}
}
