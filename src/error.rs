//! Error kinds surfaced by the public API, plus the unwinding sentinels
//! delivered to fibers through panic payloads.

use std::fmt;

/// The stack allocator could not provide a stack.
#[derive(Debug)]
pub enum StackError {
    /// The mapping or heap allocation itself failed; carries the byte size
    /// that was requested.
    ExhaustedMemory(usize),
    /// The guard page could not be protected.
    GuardPage,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::ExhaustedMemory(size) => {
                write!(f, "failed to allocate a {} byte fiber stack", size)
            }
            StackError::GuardPage => write!(f, "failed to protect the stack guard page"),
        }
    }
}

impl std::error::Error for StackError {}

/// Failure to spawn a fiber. Fatal to that spawn, not to the program.
#[derive(Debug)]
pub enum SpawnError {
    Stack(StackError),
    /// The stack is too small to hold the control block and a usable frame.
    StackTooSmall,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Stack(e) => write!(f, "spawn failed: {}", e),
            SpawnError::StackTooSmall => write!(f, "spawn failed: stack too small"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Stack(e) => Some(e),
            SpawnError::StackTooSmall => None,
        }
    }
}

impl From<StackError> for SpawnError {
    fn from(e: StackError) -> Self {
        SpawnError::Stack(e)
    }
}

/// Misuse of a blocking primitive.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinError {
    /// A fiber attempted to join itself.
    Deadlock,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Deadlock => write!(f, "fiber attempted to join itself"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Panic payload delivered at an interruption point after
/// [`Fiber::interrupt`](crate::Fiber::interrupt).
///
/// The fiber trampoline treats an escaping `Interrupted` as a normal
/// termination. User code may catch it with `std::panic::catch_unwind` to
/// run cleanup before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber interrupted")
    }
}

/// Panic payload used to reclaim still-running fibers during scheduler
/// teardown. Only the trampoline may absorb it; user code that swallows it
/// breaks teardown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForcedUnwind;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_chains_stack_error() {
        let err = SpawnError::from(StackError::ExhaustedMemory(4096));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_join_error_display() {
        assert_eq!(JoinError::Deadlock.to_string(), "fiber attempted to join itself");
    }
}
