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

//! Fiber stack allocation.

use crate::error::StackError;

/// Default usable stack size handed to new fibers.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack size an allocator will hand out.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// A raw stack region.
///
/// `base` points one past the highest usable byte; stacks grow downward on
/// every supported target. Guard pages, if any, live below `base - size`
/// and are the allocator's concern.
#[derive(Clone, Copy, Debug)]
pub struct StackContext {
    pub base: *mut u8,
    pub size: usize,
}

unsafe impl Send for StackContext {}

/// Allocates and releases fiber stacks.
///
/// The scheduler reserves space for the fiber control block at the top of
/// the returned region, so the usable stack a fiber actually sees is
/// slightly smaller than `size`.
pub trait StackAllocator {
    fn allocate(&self) -> Result<StackContext, StackError>;

    /// # Safety
    ///
    /// `sctx` must have come from `allocate` on this allocator and nothing
    /// may reference the region afterwards.
    unsafe fn deallocate(&self, sctx: &StackContext);
}

fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        } else {
            4096
        }
    }
}

fn round_up_to_page(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}

/// Plain heap-backed stacks without guard pages.
///
/// Cheap and portable; an overflowing fiber silently corrupts adjacent
/// memory, so this is only appropriate when stack depth is known.
#[derive(Clone, Copy, Debug)]
pub struct FixedSizeStack {
    size: usize,
}

impl FixedSizeStack {
    pub fn new(size: usize) -> Self {
        FixedSizeStack {
            size: size.max(MIN_STACK_SIZE),
        }
    }
}

impl Default for FixedSizeStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

impl StackAllocator for FixedSizeStack {
    fn allocate(&self) -> Result<StackContext, StackError> {
        let layout = std::alloc::Layout::from_size_align(self.size, 16).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(StackError::ExhaustedMemory(self.size));
        }
        Ok(StackContext {
            base: unsafe { ptr.add(self.size) },
            size: self.size,
        })
    }

    unsafe fn deallocate(&self, sctx: &StackContext) {
        let layout = std::alloc::Layout::from_size_align(sctx.size, 16).unwrap();
        std::alloc::dealloc(sctx.base.sub(sctx.size), layout);
    }
}

/// Mmap-backed stacks with a `PROT_NONE` guard page at the bottom, so an
/// overflow faults instead of corrupting the neighbour allocation. This is
/// the allocator `Fiber::spawn` uses.
#[derive(Clone, Copy, Debug)]
pub struct ProtectedFixedSizeStack {
    size: usize,
}

impl ProtectedFixedSizeStack {
    pub fn new(size: usize) -> Self {
        ProtectedFixedSizeStack {
            size: size.max(MIN_STACK_SIZE),
        }
    }
}

impl Default for ProtectedFixedSizeStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl StackAllocator for ProtectedFixedSizeStack {
            fn allocate(&self) -> Result<StackContext, StackError> {
                let page = page_size();
                let usable = round_up_to_page(self.size, page);
                let total = usable + page;

                let map = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        total,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if map == libc::MAP_FAILED {
                    return Err(StackError::ExhaustedMemory(total));
                }
                // Bottom page becomes the guard.
                if unsafe { libc::mprotect(map, page, libc::PROT_NONE) } != 0 {
                    unsafe { libc::munmap(map, total) };
                    return Err(StackError::GuardPage);
                }
                Ok(StackContext {
                    base: unsafe { map.cast::<u8>().add(total) },
                    size: usable,
                })
            }

            unsafe fn deallocate(&self, sctx: &StackContext) {
                let page = page_size();
                let total = sctx.size + page;
                libc::munmap(sctx.base.sub(total).cast(), total);
            }
        }
    } else {
        // No guard-page machinery off unix; fall back to heap stacks.
        impl StackAllocator for ProtectedFixedSizeStack {
            fn allocate(&self) -> Result<StackContext, StackError> {
                FixedSizeStack::new(self.size).allocate()
            }

            unsafe fn deallocate(&self, sctx: &StackContext) {
                FixedSizeStack::new(self.size).deallocate(sctx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size_geometry() {
        let alloc = FixedSizeStack::new(64 * 1024);
        let sctx = alloc.allocate().unwrap();
        assert_eq!(sctx.size, 64 * 1024);
        assert!(!sctx.base.is_null());
        unsafe { alloc.deallocate(&sctx) };
    }

    #[test]
    fn test_minimum_is_enforced() {
        let alloc = FixedSizeStack::new(1);
        let sctx = alloc.allocate().unwrap();
        assert!(sctx.size >= MIN_STACK_SIZE);
        unsafe { alloc.deallocate(&sctx) };
    }

    #[test]
    fn test_protected_rounds_to_pages() {
        let alloc = ProtectedFixedSizeStack::new(MIN_STACK_SIZE + 1);
        let sctx = alloc.allocate().unwrap();
        assert_eq!(sctx.size % page_size(), 0);
        assert!(sctx.size > MIN_STACK_SIZE);
        // The whole usable region must be writable.
        unsafe {
            sctx.base.sub(sctx.size).write(0xaa);
            sctx.base.sub(1).write(0xbb);
            alloc.deallocate(&sctx);
        }
    }
}
