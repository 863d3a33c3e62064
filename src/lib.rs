//! Stackful cooperative fibers.
//!
//! A fiber is an independently schedulable flow of control with its own
//! stack, multiplexed onto one or more OS threads. Fibers yield the CPU
//! only at explicit suspension points (`yield_now`, sleeps, joins); one
//! scheduler per thread picks the next runnable fiber through a pluggable
//! policy, and the [`WorkStealing`] policy lets idle threads rob busy
//! ones.
//!
//! ```no_run
//! use waffle_fiber::Fiber;
//!
//! let fiber = Fiber::spawn(|| {
//!     waffle_fiber::yield_now();
//! }).unwrap();
//! fiber.join().unwrap();
//! ```

mod algo;
mod context;
mod cpu;
mod error;
mod fiber;
mod fls;
mod queues;
mod scheduler;
mod stack;

pub use algo::{Algorithm, ReadyContext, RoundRobin, WorkStealing};
pub use error::{Interrupted, JoinError, SpawnError, StackError};
pub use fiber::{
    current_id, interruption_point, is_interruption_requested, set_reactor, set_wait_interval,
    sleep_for, sleep_until, use_scheduling_algorithm, yield_now, DisableInterruption, Fiber,
    FiberId,
};
pub use fls::FiberLocal;
pub use scheduler::Reactor;
pub use stack::{
    FixedSizeStack, ProtectedFixedSizeStack, StackAllocator, StackContext, DEFAULT_STACK_SIZE,
    MIN_STACK_SIZE,
};
