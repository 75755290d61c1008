// SPDX-License-Identifier: Apache-2.0

//! Machine stack context and the x86_64 switch trampoline. See [`StackContext`] and
//! [`switch`].
//!
//! The switch itself saves/restores only the callee-saved registers the System V AMD64
//! ABI requires a callee to preserve (`rbx`, `rbp`, `r12`-`r15`) plus the stack
//! pointer; everything else is caller-saved and already spilled by the compiler around
//! the call to [`switch`]. A freshly created context is primed so that the first
//! `switch` into it "returns" into [`trampoline`], which then calls the fiber's entry
//! routine.

use std::arch::naked_asm;
use std::cell::Cell;

/// Saved machine state for one fiber's stack. Never touched directly by Rust code
/// after creation; only read/written by the raw `switch` routine.
#[repr(C)]
#[derive(Debug, Default)]
pub struct StackContext {
    rsp: u64,
}

thread_local! {
    /// Scratch slot used to hand the entry routine pointer and argument to
    /// [`trampoline`] immediately after the first switch into a fresh context. Safe
    /// because a context is only ever switched into on the OS thread that owns its
    /// strand, and the value is consumed before any other fiber could overwrite it.
    static PENDING_ENTRY: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// A fiber entry point: receives the raw argument pointer it was created with.
pub type EntryFn = extern "C" fn(arg: usize) -> !;

/// Builds a fresh [`StackContext`] atop `stack`, primed to invoke `entry(arg)` the
/// first time it is switched into.
///
/// `stack` must be the *full* guarded mapping from [`super::alloc`]; the highest
/// address (stacks grow down) is used as the initial stack pointer.
///
/// # Safety
///
/// `stack` must remain valid and exclusively owned by the resulting context for as
/// long as it may be switched into.
pub unsafe fn prepare(stack: &mut [u8], entry: EntryFn, arg: usize) -> StackContext {
    PENDING_ENTRY.with(|cell| cell.set((entry as usize, arg)));

    let top = stack.as_mut_ptr().add(stack.len());
    let aligned_top = ((top as usize) & !0xf) as *mut u64;

    // `switch` pops rbx/rbp/r12-r15 (6 words) before its `ret`, so a freshly primed
    // stack must carry 6 placeholder words under the return address, not just the
    // address alone - otherwise the first switch into this context pops garbage into
    // callee-saved registers and `ret`s to whatever followed. 8 words (not 7) keeps
    // `sp` itself 16-byte aligned, which is what makes `rsp` land on the ABI's
    // required "8 mod 16" value once `switch`'s 6 pops and final `ret` run.
    let sp = aligned_top.sub(8);
    for i in 0..6 {
        sp.add(i).write(0);
    }
    sp.add(6).write(trampoline as usize as u64);
    // sp.add(7) is unused padding, never read by `switch`.

    StackContext { rsp: sp as u64 }
}

/// First thing executed on a freshly switched-into stack. Reads the entry routine
/// stashed by [`prepare`] and calls it; fibers never return from their entry routine
/// (they call into the strand's exit path instead), so this never returns either.
extern "C" fn trampoline() -> ! {
    let (entry, arg) = PENDING_ENTRY.with(Cell::get);
    // SAFETY: `entry` was produced from a valid `EntryFn` by `prepare` just before
    // this stack was first switched into.
    let entry: EntryFn = unsafe { std::mem::transmute::<usize, EntryFn>(entry) };
    entry(arg)
}

/// Saves the current callee-saved registers and stack pointer into `*old`, then loads
/// them from `*new` and resumes execution there.
///
/// # Safety
///
/// `old` and `new` must each point to a valid, non-aliasing [`StackContext`]; `new`
/// must have been produced by [`prepare`] or by a previous `switch` away from a fiber
/// that is safe to resume (not already running elsewhere).
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut StackContext, new: *const StackContext) {
    naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_aligns_stack_pointer() {
        let mut stack = vec![0u8; 64 * 1024];
        extern "C" fn noop_entry(_arg: usize) -> ! {
            loop {
                std::hint::spin_loop();
            }
        }
        // SAFETY: `stack` is exclusively owned by this test and not switched into.
        let ctx = unsafe { prepare(&mut stack, noop_entry, 0) };
        assert_eq!(ctx.rsp % 16, 0, "prepared rsp must be 16-byte aligned");
    }
}
