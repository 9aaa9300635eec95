// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Saved execution contexts.
//!
//! An `ExecutionContext` is the minimum state needed to continue a thread of
//! control later: stack pointer, resume address, frame link, one context
//! word handed to the resumed code, and the callee-saved registers of the
//! target ABI. Caller-saved registers are dead at every switch point, so
//! they are never stored.

use std::fmt;

use static_assertions::const_assert_eq;

use crate::arch::{self, CalleeSaved};

/// Entry point of a fresh context. Receives the context word.
pub(crate) type EntryFn = extern "C" fn(usize) -> !;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ExecutionContext {
    pub(crate) sp: usize,
    pub(crate) pc: usize,
    pub(crate) fp: usize,
    pub(crate) ctxt: usize,
    pub(crate) regs: CalleeSaved,
    pub(crate) resumable: bool,
}

// The register backends address these fields by fixed offset.
const_assert_eq!(std::mem::offset_of!(ExecutionContext, sp), 0);
const_assert_eq!(std::mem::offset_of!(ExecutionContext, pc), 8);
const_assert_eq!(std::mem::offset_of!(ExecutionContext, fp), 16);
const_assert_eq!(std::mem::offset_of!(ExecutionContext, ctxt), 24);
const_assert_eq!(std::mem::offset_of!(ExecutionContext, regs), 32);

impl ExecutionContext {
    /// A context that starts `entry(arg)` on the stack ending at
    /// `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the exclusive upper bound of writable memory that
    /// stays alive and otherwise unused for as long as the context runs.
    pub(crate) unsafe fn entry(stack_top: usize, entry: EntryFn, arg: usize) -> Self {
        let mut ctx = Self::default();
        arch::prepare_entry(&mut ctx, stack_top, entry, arg);
        ctx.resumable = true;
        ctx
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn ctxt(&self) -> usize {
        self.ctxt
    }

    /// Whether a switch primitive may continue this context.
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("fp", &format_args!("{:#x}", self.fp))
            .field("ctxt", &format_args!("{:#x}", self.ctxt))
            .field("resumable", &self.resumable)
            .finish()
    }
}

/// Snapshot the caller's pc, sp, frame link and callee-saved registers
/// without transferring control.
///
/// The snapshot describes a frame that keeps running and will return, so it
/// is never resumable; the switch primitives produce the contexts that
/// `resume` accepts.
#[inline(always)]
pub fn save_context() -> ExecutionContext {
    let mut ctx = ExecutionContext::default();
    // SAFETY: `ctx` is a live local, writable for its full size.
    unsafe { arch::capture(&mut ctx) };
    ctx.resumable = false;
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn snapshot_in_callee() -> (ExecutionContext, usize) {
        let ctx = save_context();
        (ctx, arch::current_sp())
    }

    #[test]
    fn snapshot_describes_the_caller() {
        let ctx = save_context();
        let here = arch::current_sp();
        assert!(!ctx.is_resumable());
        assert_ne!(ctx.pc(), 0);
        assert!(ctx.sp().abs_diff(here) < 4096, "{ctx:?} vs sp {here:#x}");
    }

    #[test]
    fn deeper_frames_capture_lower_stack_pointers() {
        let outer = save_context();
        let (inner, inner_sp) = snapshot_in_callee();
        assert!(inner.sp() <= outer.sp() || inner_sp < outer.sp());
    }

    #[test]
    fn debug_prints_addresses_in_hex() {
        let ctx = ExecutionContext {
            sp: 0x1000,
            pc: 0x2000,
            ..Default::default()
        };
        let s = format!("{ctx:?}");
        assert!(s.contains("sp: 0x1000"), "{s}");
        assert!(s.contains("pc: 0x2000"), "{s}");
    }
}
