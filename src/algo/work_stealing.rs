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

//! Random work stealing across schedulers.
//!
//! One instance per thread. Instances register themselves in a
//! process-wide list and steal single contexts from a uniformly random
//! peer when their own queues run dry. Migratable workers live in a
//! Chase–Lev deque: the owner pushes and pops one end (LIFO), thieves take
//! the other (FIFO), and no element is ever observed by two consumers.

use std::cell::UnsafeCell;
use std::time::Instant;

use crossbeam_deque::{Steal, Stealer, Worker};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rand::distributions::{Distribution, Uniform};

use super::{Algorithm, ReadyContext};
use crate::context::ContextRef;
use crate::queues::ReadyList;
use crate::scheduler::Scheduler;

/// Process-wide list of stealable queues; a dropped instance leaves a
/// tombstone so peer indices stay stable.
static SCHEDULERS: Lazy<Mutex<Vec<Option<Stealer<ContextRef>>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

pub struct WorkStealing {
    idx: usize,

    /// Pinned contexts; never leave this thread.
    lqueue: UnsafeCell<ReadyList>,

    /// Migratable workers. Detached contexts carry their own reference
    /// through the deque.
    rqueue: Worker<ContextRef>,

    /// Whether `suspend_until` really parks. Off by default: an idle
    /// instance keeps spinning so it can steal without being notified.
    suspend: bool,

    flag: Mutex<bool>,
    parked: Condvar,
}

// lqueue and rqueue are owner-thread only; cross-thread access goes
// through the registered `Stealer` and the parking mutex/condvar.
unsafe impl Send for WorkStealing {}
unsafe impl Sync for WorkStealing {}

impl WorkStealing {
    pub fn new(suspend: bool) -> WorkStealing {
        let rqueue = Worker::new_lifo();
        let mut schedulers = SCHEDULERS.lock();
        let idx = schedulers.len();
        schedulers.push(Some(rqueue.stealer()));
        WorkStealing {
            idx,
            lqueue: UnsafeCell::new(ReadyList::new()),
            rqueue,
            suspend,
            flag: Mutex::new(false),
            parked: Condvar::new(),
        }
    }

    /// Takes one context from the thief end of this instance's deque.
    fn steal_from(stealer: &Stealer<ContextRef>) -> Option<ContextRef> {
        loop {
            match stealer.steal() {
                Steal::Success(ctx) => return Some(ctx),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Picks a uniformly random registered peer distinct from this
    /// instance and tries to rob it once.
    fn steal_from_peer(&self) -> Option<ContextRef> {
        let stealer = {
            let schedulers = SCHEDULERS.lock();
            if schedulers.len() < 2 {
                return None;
            }
            let between = Uniform::from(0..schedulers.len());
            let mut rng = rand::thread_rng();
            let mut victim = self.idx;
            // Bounded retry over tombstoned slots.
            for _ in 0..8 {
                let idx = between.sample(&mut rng);
                if idx != self.idx && schedulers[idx].is_some() {
                    victim = idx;
                    break;
                }
            }
            if victim == self.idx {
                return None;
            }
            schedulers[victim].as_ref().unwrap().clone()
        };
        let stolen = Self::steal_from(&stealer);
        if stolen.is_some() {
            log::trace!("work-stealing instance {} stole a fiber", self.idx);
        }
        stolen
    }

    /// Adopts a detached context: rewrite its scheduler back-pointer to
    /// this thread's scheduler, which takes an owning reference.
    fn attach(ctx: ContextRef) -> ReadyContext {
        Scheduler::current().attach_worker(&ctx);
        ReadyContext(ctx)
    }
}

impl Algorithm for WorkStealing {
    fn awakened(&self, ctx: ReadyContext) {
        if ctx.is_pinned() {
            unsafe { &mut *self.lqueue.get() }.push(ctx.0);
            return;
        }
        // Detach from the current scheduler; from here on any instance may
        // pick the context up.
        let sched = ctx.0.scheduler_ptr();
        if !sched.is_null() {
            if let Some(owned) = unsafe { (*sched).detach_worker(&ctx.0) } {
                self.rqueue.push(owned);
                return;
            }
        }
        self.rqueue.push(ctx.0);
    }

    fn pick_next(&self) -> Option<ReadyContext> {
        if let Some(ctx) = self.rqueue.pop() {
            return Some(Self::attach(ctx));
        }
        if let Some(ctx) = unsafe { &mut *self.lqueue.get() }.pop() {
            return Some(ReadyContext(ctx));
        }
        self.steal_from_peer().map(Self::attach)
    }

    fn has_ready(&self) -> bool {
        !unsafe { &*self.lqueue.get() }.is_empty() || !self.rqueue.is_empty()
    }

    fn suspend_until(&self, deadline: Option<Instant>) {
        if !self.suspend {
            // Keep spinning; an idle instance is also the only one that
            // can steal queued work from busy peers.
            std::thread::yield_now();
            return;
        }
        let mut flag = self.flag.lock();
        match deadline {
            Some(tp) => {
                while !*flag {
                    if self.parked.wait_until(&mut flag, tp).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*flag {
                    self.parked.wait(&mut flag);
                }
            }
        }
        *flag = false;
    }

    fn notify(&self) {
        if !self.suspend {
            return;
        }
        let mut flag = self.flag.lock();
        *flag = true;
        drop(flag);
        self.parked.notify_all();
    }
}

impl Drop for WorkStealing {
    fn drop(&mut self) {
        let mut schedulers = SCHEDULERS.lock();
        schedulers[self.idx] = None;
        // The last instance out clears the registry entirely.
        if schedulers.iter().all(|slot| slot.is_none()) {
            schedulers.clear();
        }
    }
}

/// The registry is process-wide state; tests that touch it take this lock
/// so they cannot steal each other's fibers.
#[cfg(test)]
pub(crate) static TEST_SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{sleep_for, use_scheduling_algorithm, yield_now, Fiber};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Barrier, Mutex as StdMutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_registry_assigns_indices_and_tombstones() {
        let _serial = TEST_SERIAL.lock();
        let a = WorkStealing::new(false);
        let b = WorkStealing::new(false);
        assert_ne!(a.idx, b.idx);
        {
            let schedulers = SCHEDULERS.lock();
            assert!(schedulers[a.idx].is_some());
            assert!(schedulers[b.idx].is_some());
        }
        let a_idx = a.idx;
        drop(a);
        {
            let schedulers = SCHEDULERS.lock();
            assert!(schedulers[a_idx].is_none());
        }
        drop(b);
        assert!(SCHEDULERS.lock().is_empty());
    }

    #[test]
    fn test_steal_from_empty_peer_returns_none() {
        let _serial = TEST_SERIAL.lock();
        let a = WorkStealing::new(false);
        let b = WorkStealing::new(false);
        assert!(a.steal_from_peer().is_none());
        assert!(!b.has_ready());
        drop(a);
        drop(b);
    }

    #[test]
    fn test_workers_migrate_to_an_idle_scheduler() {
        let _serial = TEST_SERIAL.lock();
        const FIBERS: usize = 1000;

        let ready = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let ran_on: Arc<StdMutex<Vec<thread::ThreadId>>> = Arc::new(StdMutex::new(Vec::new()));
        let (id_tx, id_rx) = mpsc::channel::<thread::ThreadId>();

        // Initially idle scheduler; its main fiber sleeps so the
        // dispatcher has nothing local and goes robbing.
        let thief = {
            let ready = ready.clone();
            let done = done.clone();
            thread::spawn(move || {
                use_scheduling_algorithm(WorkStealing::new(false));
                id_tx.send(thread::current().id()).unwrap();
                ready.wait();
                while !done.load(Ordering::SeqCst) {
                    sleep_for(Duration::from_millis(1));
                }
            })
        };

        let spawner = {
            let ready = ready.clone();
            let done = done.clone();
            let ran_on = ran_on.clone();
            thread::spawn(move || {
                use_scheduling_algorithm(WorkStealing::new(false));
                ready.wait();
                let mut fibers = Vec::with_capacity(FIBERS);
                for _ in 0..FIBERS {
                    let ran_on = ran_on.clone();
                    fibers.push(
                        Fiber::spawn(move || {
                            ran_on.lock().unwrap().push(thread::current().id());
                            yield_now();
                        })
                        .unwrap(),
                    );
                }
                for fiber in fibers {
                    fiber.join().unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let thief_id = id_rx.recv().unwrap();
        spawner.join().unwrap();
        thief.join().unwrap();

        let ran_on = ran_on.lock().unwrap();
        assert_eq!(ran_on.len(), FIBERS);
        assert!(
            ran_on.iter().any(|id| *id == thief_id),
            "the idle scheduler never stole a fiber"
        );
    }
}
