// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! x86_64 System V backend.
//!
//! Callee-saved state: rsp, rbp, rbx, r12-r15, MXCSR and the x87 control
//! word. The resume address is the return address of the `swap`/`capture`
//! call, so a resumed context continues right after that call with the
//! stack pointer it had once the call returned.

use std::arch::{asm, naked_asm};
use std::mem::offset_of;

use crate::context::{EntryFn, ExecutionContext};
use crate::memory::round_down;

use super::STACK_ALIGN;

/// Default MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Default x87 control word: extended precision, exceptions masked.
const FPCW_DEFAULT: u16 = 0x037F;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeSaved {
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpcw: u16,
    _pad: u16,
}

impl Default for CalleeSaved {
    fn default() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: MXCSR_DEFAULT,
            fpcw: FPCW_DEFAULT,
            _pad: 0,
        }
    }
}

const SP: usize = offset_of!(ExecutionContext, sp);
const PC: usize = offset_of!(ExecutionContext, pc);
const FP: usize = offset_of!(ExecutionContext, fp);
const CTXT: usize = offset_of!(ExecutionContext, ctxt);
const REGS: usize = offset_of!(ExecutionContext, regs);
const RBX: usize = REGS + offset_of!(CalleeSaved, rbx);
const R12: usize = REGS + offset_of!(CalleeSaved, r12);
const R13: usize = REGS + offset_of!(CalleeSaved, r13);
const R14: usize = REGS + offset_of!(CalleeSaved, r14);
const R15: usize = REGS + offset_of!(CalleeSaved, r15);
const MXCSR: usize = REGS + offset_of!(CalleeSaved, mxcsr);
const FPCW: usize = REGS + offset_of!(CalleeSaved, fpcw);

/// Save the caller into `save` (rdi), continue at `load` (rsi).
///
/// # Safety
///
/// `save` must be writable, `load` must hold a context produced by `swap`
/// or `prepare_entry` whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(_save: *mut ExecutionContext, _load: *const ExecutionContext) {
    naked_asm!(
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + {sp}], rcx",
        "mov [rdi + {pc}], rax",
        "mov [rdi + {fp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "stmxcsr [rdi + {mxcsr}]",
        "fnstcw [rdi + {fpcw}]",
        "ldmxcsr [rsi + {mxcsr}]",
        "fldcw [rsi + {fpcw}]",
        "mov rsp, [rsi + {sp}]",
        "mov rbp, [rsi + {fp}]",
        "mov rbx, [rsi + {rbx}]",
        "mov r12, [rsi + {r12}]",
        "mov r13, [rsi + {r13}]",
        "mov r14, [rsi + {r14}]",
        "mov r15, [rsi + {r15}]",
        "mov rcx, [rsi + {pc}]",
        "mov rdi, [rsi + {ctxt}]",
        "jmp rcx",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        ctxt = const CTXT,
        rbx = const RBX,
        r12 = const R12,
        r13 = const R13,
        r14 = const R14,
        r15 = const R15,
        mxcsr = const MXCSR,
        fpcw = const FPCW,
    )
}

/// Continue at `load` (rdi). The current frame is abandoned.
///
/// # Safety
///
/// Same requirements on `load` as [`swap`]. Nothing live may remain in the
/// abandoned frames.
#[unsafe(naked)]
pub unsafe extern "C" fn jump(_load: *const ExecutionContext) -> ! {
    naked_asm!(
        "ldmxcsr [rdi + {mxcsr}]",
        "fldcw [rdi + {fpcw}]",
        "mov rsp, [rdi + {sp}]",
        "mov rbp, [rdi + {fp}]",
        "mov rbx, [rdi + {rbx}]",
        "mov r12, [rdi + {r12}]",
        "mov r13, [rdi + {r13}]",
        "mov r14, [rdi + {r14}]",
        "mov r15, [rdi + {r15}]",
        "mov rcx, [rdi + {pc}]",
        "mov rdi, [rdi + {ctxt}]",
        "jmp rcx",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        ctxt = const CTXT,
        rbx = const RBX,
        r12 = const R12,
        r13 = const R13,
        r14 = const R14,
        r15 = const R15,
        mxcsr = const MXCSR,
        fpcw = const FPCW,
    )
}

/// Store the caller's resumption state into `out` (rdi) and return.
///
/// # Safety
///
/// `out` must be writable.
#[unsafe(naked)]
pub unsafe extern "C" fn capture(_out: *mut ExecutionContext) {
    naked_asm!(
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + {sp}], rcx",
        "mov [rdi + {pc}], rax",
        "mov [rdi + {fp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "stmxcsr [rdi + {mxcsr}]",
        "fnstcw [rdi + {fpcw}]",
        "ret",
        sp = const SP,
        pc = const PC,
        fp = const FP,
        rbx = const RBX,
        r12 = const R12,
        r13 = const R13,
        r14 = const R14,
        r15 = const R15,
        mxcsr = const MXCSR,
        fpcw = const FPCW,
    )
}

#[inline(always)]
pub fn current_sp() -> usize {
    let sp: usize;
    // SAFETY: reads a register, touches no memory.
    unsafe { asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
    sp
}

/// Make `ctx` start `entry(arg)` with the stack ending at `stack_top`.
///
/// The entry sees a null return address, as if called from a frame that
/// ends every backtrace.
///
/// # Safety
///
/// `stack_top` must be the exclusive upper bound of writable stack memory
/// with room for at least one word below it.
pub unsafe fn prepare_entry(ctx: &mut ExecutionContext, stack_top: usize, entry: EntryFn, arg: usize) {
    let sp = round_down(stack_top, STACK_ALIGN) - 8;
    (sp as *mut usize).write(0);
    ctx.sp = sp;
    ctx.pc = entry as usize;
    ctx.fp = 0;
    ctx.ctxt = arg;
    ctx.regs = CalleeSaved::default();
}
