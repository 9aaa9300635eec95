// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! AArch64 (AAPCS64) backend.
//!
//! Callee-saved state: sp, x29 (frame link), x19-x28 and the low halves of
//! v8-v15. The resume address is the link register at the `swap`/`capture`
//! call, and `jump` returns through it.

use std::arch::{asm, naked_asm};
use std::mem::offset_of;

use crate::context::{EntryFn, ExecutionContext};
use crate::memory::round_down;

use super::STACK_ALIGN;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalleeSaved {
    x: [u64; 10],
    d: [u64; 8],
}

const SP: usize = offset_of!(ExecutionContext, sp);
const PC: usize = offset_of!(ExecutionContext, pc);
const FP: usize = offset_of!(ExecutionContext, fp);
const CTXT: usize = offset_of!(ExecutionContext, ctxt);
const REGS: usize = offset_of!(ExecutionContext, regs);
const X19: usize = REGS + offset_of!(CalleeSaved, x);
const X21: usize = X19 + 16;
const X23: usize = X19 + 32;
const X25: usize = X19 + 48;
const X27: usize = X19 + 64;
const D8: usize = REGS + offset_of!(CalleeSaved, d);
const D10: usize = D8 + 16;
const D12: usize = D8 + 32;
const D14: usize = D8 + 48;

/// Save the caller into `save` (x0), continue at `load` (x1).
///
/// # Safety
///
/// `save` must be writable, `load` must hold a context produced by `swap`
/// or `prepare_entry` whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(_save: *mut ExecutionContext, _load: *const ExecutionContext) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #{sp}]",
        "str x30, [x0, #{pc}]",
        "str x29, [x0, #{fp}]",
        "stp x19, x20, [x0, #{x19}]",
        "stp x21, x22, [x0, #{x21}]",
        "stp x23, x24, [x0, #{x23}]",
        "stp x25, x26, [x0, #{x25}]",
        "stp x27, x28, [x0, #{x27}]",
        "stp d8, d9, [x0, #{d8}]",
        "stp d10, d11, [x0, #{d10}]",
        "stp d12, d13, [x0, #{d12}]",
        "stp d14, d15, [x0, #{d14}]",
        "ldr x9, [x1, #{sp}]",
        "mov sp, x9",
        "ldr x30, [x1, #{pc}]",
        "ldr x29, [x1, #{fp}]",
        "ldp x19, x20, [x1, #{x19}]",
        "ldp x21, x22, [x1, #{x21}]",
        "ldp x23, x24, [x1, #{x23}]",
        "ldp x25, x26, [x1, #{x25}]",
        "ldp x27, x28, [x1, #{x27}]",
        "ldp d8, d9, [x1, #{d8}]",
        "ldp d10, d11, [x1, #{d10}]",
        "ldp d12, d13, [x1, #{d12}]",
        "ldp d14, d15, [x1, #{d14}]",
        "ldr x0, [x1, #{ctxt}]",
        "ret",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        ctxt = const CTXT,
        x19 = const X19,
        x21 = const X21,
        x23 = const X23,
        x25 = const X25,
        x27 = const X27,
        d8 = const D8,
        d10 = const D10,
        d12 = const D12,
        d14 = const D14,
    )
}

/// Continue at `load` (x0). The current frame is abandoned.
///
/// # Safety
///
/// Same requirements on `load` as [`swap`]. Nothing live may remain in the
/// abandoned frames.
#[unsafe(naked)]
pub unsafe extern "C" fn jump(_load: *const ExecutionContext) -> ! {
    naked_asm!(
        "ldr x9, [x0, #{sp}]",
        "mov sp, x9",
        "ldr x30, [x0, #{pc}]",
        "ldr x29, [x0, #{fp}]",
        "ldp x19, x20, [x0, #{x19}]",
        "ldp x21, x22, [x0, #{x21}]",
        "ldp x23, x24, [x0, #{x23}]",
        "ldp x25, x26, [x0, #{x25}]",
        "ldp x27, x28, [x0, #{x27}]",
        "ldp d8, d9, [x0, #{d8}]",
        "ldp d10, d11, [x0, #{d10}]",
        "ldp d12, d13, [x0, #{d12}]",
        "ldp d14, d15, [x0, #{d14}]",
        "ldr x0, [x0, #{ctxt}]",
        "ret",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        ctxt = const CTXT,
        x19 = const X19,
        x21 = const X21,
        x23 = const X23,
        x25 = const X25,
        x27 = const X27,
        d8 = const D8,
        d10 = const D10,
        d12 = const D12,
        d14 = const D14,
    )
}

/// Store the caller's resumption state into `out` (x0) and return.
///
/// # Safety
///
/// `out` must be writable.
#[unsafe(naked)]
pub unsafe extern "C" fn capture(_out: *mut ExecutionContext) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #{sp}]",
        "str x30, [x0, #{pc}]",
        "str x29, [x0, #{fp}]",
        "stp x19, x20, [x0, #{x19}]",
        "stp x21, x22, [x0, #{x21}]",
        "stp x23, x24, [x0, #{x23}]",
        "stp x25, x26, [x0, #{x25}]",
        "stp x27, x28, [x0, #{x27}]",
        "stp d8, d9, [x0, #{d8}]",
        "stp d10, d11, [x0, #{d10}]",
        "stp d12, d13, [x0, #{d12}]",
        "stp d14, d15, [x0, #{d14}]",
        "ret",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        x19 = const X19,
        x21 = const X21,
        x23 = const X23,
        x25 = const X25,
        x27 = const X27,
        d8 = const D8,
        d10 = const D10,
        d12 = const D12,
        d14 = const D14,
    )
}

#[inline(always)]
pub fn current_sp() -> usize {
    let sp: usize;
    // SAFETY: reads a register, touches no memory.
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
    sp
}

/// Make `ctx` start `entry(arg)` with the stack ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the exclusive upper bound of writable stack memory.
pub unsafe fn prepare_entry(ctx: &mut ExecutionContext, stack_top: usize, entry: EntryFn, arg: usize) {
    ctx.sp = round_down(stack_top, STACK_ALIGN);
    ctx.pc = entry as usize;
    ctx.fp = 0;
    ctx.ctxt = arg;
    ctx.regs = CalleeSaved::default();
}
