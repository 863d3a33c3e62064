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

//! Typed queues over the control block's intrusive links.
//!
//! Membership discipline: ready and worker queues own one reference per
//! linked context (pushed handles are transferred in, popped handles are
//! transferred out); the sleep tree and the terminated list link without
//! counting, covered by the owning scheduler's worker-list reference. The
//! per-context wait list owns its entries outright.

use std::time::Instant;

use intrusive_collections::{
    intrusive_adapter, KeyAdapter, LinkedList, LinkedListLink, RBTree, RBTreeLink, UnsafeRef,
};

use crate::context::{Context, ContextRef, WakeTime};

intrusive_adapter!(pub(crate) ReadyAdapter = UnsafeRef<Context>: Context { ready_link: LinkedListLink });
intrusive_adapter!(pub(crate) TerminatedAdapter = UnsafeRef<Context>: Context { terminated_link: LinkedListLink });
intrusive_adapter!(pub(crate) WorkerAdapter = UnsafeRef<Context>: Context { worker_link: LinkedListLink });
intrusive_adapter!(pub(crate) SleepAdapter = UnsafeRef<Context>: Context { sleep_link: RBTreeLink });

impl<'a> KeyAdapter<'a> for SleepAdapter {
    type Key = WakeTime;

    fn get_key(&self, ctx: &'a Context) -> WakeTime {
        ctx.wake_time()
    }
}

/// FIFO of ready contexts. Each member holds one reference.
pub(crate) struct ReadyList {
    list: LinkedList<ReadyAdapter>,
}

impl ReadyList {
    pub(crate) fn new() -> ReadyList {
        ReadyList {
            list: LinkedList::new(ReadyAdapter::new()),
        }
    }

    pub(crate) fn push(&mut self, ctx: ContextRef) {
        let raw = ContextRef::into_raw(ctx);
        self.list.push_back(unsafe { UnsafeRef::from_raw(raw) });
    }

    pub(crate) fn pop(&mut self) -> Option<ContextRef> {
        self.list
            .pop_front()
            .map(|r| unsafe { ContextRef::from_raw(UnsafeRef::into_raw(r)) })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl Drop for ReadyList {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Sleeping contexts ordered by wake time. Links without counting.
pub(crate) struct SleepSet {
    tree: RBTree<SleepAdapter>,
}

impl SleepSet {
    pub(crate) fn new() -> SleepSet {
        SleepSet {
            tree: RBTree::new(SleepAdapter::new()),
        }
    }

    /// The context's wake time must be set before insertion; it is the key.
    pub(crate) fn insert(&mut self, ctx: &Context) {
        debug_assert!(!ctx.sleep_link.is_linked());
        self.tree
            .insert(unsafe { UnsafeRef::from_raw(ctx as *const Context) });
    }

    pub(crate) fn unlink(&mut self, ctx: &Context) {
        if ctx.sleep_link.is_linked() {
            let mut cursor = unsafe { self.tree.cursor_mut_from_ptr(ctx as *const Context) };
            cursor.remove();
        }
    }

    /// Unlinks and returns the earliest sleeper whose deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<*const Context> {
        let mut front = self.tree.front_mut();
        let expired = match front.get() {
            Some(ctx) => ctx.wake_time().expired(now),
            None => false,
        };
        if !expired {
            return None;
        }
        front.remove().map(|r| UnsafeRef::into_raw(r) as *const Context)
    }

    /// Deadline of the earliest sleeper with a finite wake time.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.tree.front().get().and_then(|ctx| ctx.wake_time().0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Contexts that finished their run and await destruction by a scheduler
/// iteration on another stack. Links without counting; the worker list
/// still holds the reference.
pub(crate) struct TerminatedList {
    list: LinkedList<TerminatedAdapter>,
}

impl TerminatedList {
    pub(crate) fn new() -> TerminatedList {
        TerminatedList {
            list: LinkedList::new(TerminatedAdapter::new()),
        }
    }

    pub(crate) fn push(&mut self, ctx: &Context) {
        debug_assert!(ctx.is_terminated());
        self.list
            .push_back(unsafe { UnsafeRef::from_raw(ctx as *const Context) });
    }

    pub(crate) fn pop(&mut self) -> Option<*const Context> {
        self.list
            .pop_front()
            .map(|r| UnsafeRef::into_raw(r) as *const Context)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Every live worker attached to a scheduler. Holds the scheduler's owning
/// reference; detaching a worker for migration hands that reference to the
/// caller.
pub(crate) struct WorkerList {
    list: LinkedList<WorkerAdapter>,
}

impl WorkerList {
    pub(crate) fn new() -> WorkerList {
        WorkerList {
            list: LinkedList::new(WorkerAdapter::new()),
        }
    }

    pub(crate) fn push(&mut self, ctx: ContextRef) {
        debug_assert!(!ctx.worker_link.is_linked());
        let raw = ContextRef::into_raw(ctx);
        self.list.push_back(unsafe { UnsafeRef::from_raw(raw) });
    }

    pub(crate) fn unlink(&mut self, ctx: &Context) -> Option<ContextRef> {
        if !ctx.worker_link.is_linked() {
            return None;
        }
        let mut cursor = unsafe { self.list.cursor_mut_from_ptr(ctx as *const Context) };
        cursor
            .remove()
            .map(|r| unsafe { ContextRef::from_raw(UnsafeRef::into_raw(r)) })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Context> {
        self.list.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl Drop for WorkerList {
    fn drop(&mut self) {
        while let Some(r) = self.list.pop_front() {
            drop(unsafe { ContextRef::from_raw(UnsafeRef::into_raw(r)) });
        }
    }
}

/// Joiners blocked on one context, owned outright so a woken joiner stays
/// alive until it removes itself.
pub(crate) struct WaitList {
    waiters: Vec<ContextRef>,
}

impl WaitList {
    pub(crate) fn new() -> WaitList {
        WaitList {
            waiters: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, ctx: &Context) {
        self.waiters
            .push(unsafe { ContextRef::clone_from_raw(ctx as *const Context) });
    }

    pub(crate) fn drain(&mut self) -> Vec<ContextRef> {
        std::mem::take(&mut self.waiters)
    }

    pub(crate) fn remove(&mut self, ctx: &Context) {
        self.waiters
            .retain(|r| r.as_ptr() != ctx as *const Context);
    }
}
