// SPDX-License-Identifier: Apache-2.0

//! Guarded fiber stacks and stack switching.

pub mod context;
pub mod runqueue;

pub use context::{EntryFn, StackContext};
pub use runqueue::Runqueue;

use crate::error::StackAllocError;

pub const PAGE_SIZE: usize = 4096;

/// An anonymously-mapped fiber stack with a `PROT_NONE` guard page at the low address,
/// so a stack overflow faults instead of corrupting an adjacent mapping.
pub struct GuardedStack {
    /// Includes the guard page; `usable()` excludes it.
    mapping: *mut libc::c_void,
    mapping_len: usize,
}

// SAFETY: a `GuardedStack` is only ever owned by the single fiber/strand that uses it;
// moving it across threads is fine as long as only one thread switches into it.
unsafe impl Send for GuardedStack {}

impl GuardedStack {
    /// Allocates a stack of `page_count` usable pages (minimum 1) plus one guard page.
    pub fn new(page_count: usize) -> Result<Self, StackAllocError> {
        let page_count = page_count.max(1);
        let usable_len = page_count * PAGE_SIZE;
        let mapping_len = usable_len + PAGE_SIZE;

        // SAFETY: standard anonymous, non-file-backed mapping request.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(StackAllocError::Mmap {
                size_bytes: mapping_len,
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: `mapping` was just successfully created with `mapping_len` bytes;
        // the guard page is the first page of that mapping (stacks grow down toward
        // it).
        let guard_result = unsafe { libc::mprotect(mapping, PAGE_SIZE, libc::PROT_NONE) };
        if guard_result != 0 {
            // SAFETY: tearing down the mapping we just failed to fully protect.
            unsafe { libc::munmap(mapping, mapping_len) };
            return Err(StackAllocError::GuardPage(std::io::Error::last_os_error()));
        }

        Ok(Self {
            mapping,
            mapping_len,
        })
    }

    /// The usable region of the stack, excluding the guard page.
    pub fn usable(&mut self) -> &mut [u8] {
        // SAFETY: the usable region spans from just past the guard page to the end of
        // the mapping, both within the bounds established in `new`.
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.mapping as *mut u8).add(PAGE_SIZE),
                self.mapping_len - PAGE_SIZE,
            )
        }
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        // SAFETY: `mapping`/`mapping_len` describe exactly the region `new` mapped,
        // and this is the only place that unmaps it.
        unsafe {
            libc::munmap(self.mapping, self.mapping_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_pages() {
        let mut stack = GuardedStack::new(7).unwrap();
        assert_eq!(stack.usable().len(), 7 * PAGE_SIZE);
    }

    #[test]
    fn minimum_one_page() {
        let mut stack = GuardedStack::new(0).unwrap();
        assert_eq!(stack.usable().len(), PAGE_SIZE);
    }
}
