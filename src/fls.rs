//! Fiber-local storage.
//!
//! A `FiberLocal<T>` declared in a `static` gives every fiber its own slot
//! of `T`. The slot's address is the identity key into the fiber's raw
//! storage map; the stored value is dropped when it is replaced, removed,
//! or the fiber terminates.

use std::marker::PhantomData;

use crate::scheduler::Scheduler;

pub struct FiberLocal<T: 'static> {
    // fn pointer keeps the marker Send + Sync regardless of T.
    _marker: PhantomData<fn() -> T>,
}

unsafe fn drop_value<T>(data: *mut u8) {
    drop(Box::from_raw(data as *mut T));
}

impl<T: 'static> FiberLocal<T> {
    pub const fn new() -> FiberLocal<T> {
        FiberLocal {
            _marker: PhantomData,
        }
    }

    fn key(&'static self) -> usize {
        self as *const FiberLocal<T> as usize
    }

    /// Installs a value for the calling fiber, dropping any previous one.
    pub fn set(&'static self, value: T) {
        let data = Box::into_raw(Box::new(value)) as *mut u8;
        Scheduler::current()
            .active_context()
            .set_fls(self.key(), Some(drop_value::<T>), data, true);
    }

    /// Runs `f` with the calling fiber's value, or `None` if unset.
    pub fn with<R>(&'static self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let data = Scheduler::current().active_context().get_fls(self.key());
        f(unsafe { (data as *const T).as_ref() })
    }

    /// Drops and removes the calling fiber's value, if any.
    pub fn remove(&'static self) {
        Scheduler::current()
            .active_context()
            .set_fls(self.key(), None, std::ptr::null_mut(), true);
    }

    pub fn is_set(&'static self) -> bool {
        !Scheduler::current()
            .active_context()
            .get_fls(self.key())
            .is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{yield_now, Fiber};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    static COUNTER: FiberLocal<usize> = FiberLocal::new();

    #[test]
    fn test_slot_is_per_fiber() {
        COUNTER.set(7);
        let fiber = Fiber::spawn(|| {
            assert!(!COUNTER.is_set());
            COUNTER.set(40);
            yield_now();
            COUNTER.with(|v| assert_eq!(v, Some(&40)));
        })
        .unwrap();
        fiber.join().unwrap();
        COUNTER.with(|v| assert_eq!(v, Some(&7)));
        COUNTER.remove();
        assert!(!COUNTER.is_set());
    }

    #[test]
    fn test_replace_drops_previous_value() {
        struct Tally(Arc<AtomicUsize>);
        impl Drop for Tally {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        static SLOT: FiberLocal<Tally> = FiberLocal::new();

        let drops = Arc::new(AtomicUsize::new(0));
        let inner = drops.clone();
        let fiber = Fiber::spawn(move || {
            SLOT.set(Tally(inner.clone()));
            SLOT.set(Tally(inner.clone()));
            SLOT.remove();
        })
        .unwrap();
        fiber.join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cleanup_runs_at_termination() {
        // A terminating fiber's slot value is dropped by release(); the
        // observer reads the evidence after join.
        struct Witness {
            id: crate::FiberId,
            log: Arc<Mutex<Vec<crate::FiberId>>>,
        }
        impl Drop for Witness {
            fn drop(&mut self) {
                self.log.lock().unwrap().push(self.id);
            }
        }
        static SLOT: FiberLocal<Witness> = FiberLocal::new();

        let log: Arc<Mutex<Vec<crate::FiberId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let slot_id: Arc<Mutex<Option<crate::FiberId>>> = Arc::new(Mutex::new(None));
        let id_slot = slot_id.clone();
        let fiber = Fiber::spawn(move || {
            let id = crate::fiber::current_id();
            *id_slot.lock().unwrap() = Some(id);
            SLOT.set(Witness { id, log: sink });
        })
        .unwrap();
        fiber.join().unwrap();
        let expected = slot_id.lock().unwrap().take().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![expected]);
    }
}
