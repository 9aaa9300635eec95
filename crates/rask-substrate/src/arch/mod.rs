// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Register-level primitives, one implementation per target architecture.
//!
//! Each backend exposes the same narrow interface:
//! - `swap(save, load)`: store the caller's resumption state into `save`,
//!   then continue at `load`. Returns when something jumps back to `save`.
//! - `jump(load) -> !`: continue at `load`, abandoning the current frame.
//! - `capture(out)`: store the caller's resumption state, keep going.
//! - `current_sp()`: the stack pointer at the call site.
//! - `prepare_entry(...)`: build a context that starts `entry(arg)` on a
//!   fresh stack.
//!
//! A context that is jumped to receives its `ctxt` word as the first
//! argument register, so fresh entries get their argument without any
//! extra trampoline code.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86_64::{capture, current_sp, jump, prepare_entry, swap, CalleeSaved};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use self::aarch64::{capture, current_sp, jump, prepare_entry, swap, CalleeSaved};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("rask-substrate supports x86_64 and aarch64 only");

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rask-substrate requires a 64-bit target");

use crate::context::ExecutionContext;
use crate::error::Violation;

/// Required alignment of a stack pointer at a call boundary.
pub(crate) const STACK_ALIGN: usize = 16;

/// Scratch stack used by [`check`].
const CHECK_STACK_WORDS: usize = 1024;

struct CheckFrame {
    home: ExecutionContext,
    arg_seen: usize,
    sp_seen: usize,
}

extern "C" fn check_entry(arg: usize) -> ! {
    let frame = arg as *mut CheckFrame;
    // SAFETY: `check` passes a pointer to a live `CheckFrame` and stays
    // suspended in `swap` until we jump back to `home`.
    unsafe {
        (*frame).arg_seen = arg;
        (*frame).sp_seen = current_sp();
        jump(&(*frame).home)
    }
}

/// Round-trip the primitives once on a scratch stack and check that the
/// argument, stack pointer and resumption all behave.
pub(crate) fn check() -> Result<(), Violation> {
    let probe = crate::context::save_context();
    if probe.pc == 0 || probe.sp == 0 {
        return Err(Violation::ArchCheck("capture returned an empty context"));
    }
    let here = current_sp();
    if probe.sp.abs_diff(here) > 64 * 1024 {
        return Err(Violation::ArchCheck("captured sp is not on the current stack"));
    }

    let mut scratch = vec![0u128; CHECK_STACK_WORDS];
    let lo = scratch.as_mut_ptr() as usize;
    let hi = lo + CHECK_STACK_WORDS * std::mem::size_of::<u128>();

    let mut frame = CheckFrame {
        home: ExecutionContext::default(),
        arg_seen: 0,
        sp_seen: 0,
    };
    let frame_ptr = &mut frame as *mut CheckFrame;
    let arg = frame_ptr as usize;
    let mut entry = ExecutionContext::default();
    // SAFETY: `scratch` outlives the round trip and nothing else uses it;
    // `frame` is only touched through `frame_ptr` until the swap returns.
    let (arg_seen, sp_seen) = unsafe {
        prepare_entry(&mut entry, hi, check_entry, arg);
        swap(std::ptr::addr_of_mut!((*frame_ptr).home), &entry);
        ((*frame_ptr).arg_seen, (*frame_ptr).sp_seen)
    };
    drop(scratch);

    if arg_seen != arg {
        return Err(Violation::ArchCheck("entry argument was not delivered"));
    }
    if !(lo..hi).contains(&sp_seen) {
        return Err(Violation::ArchCheck("entry did not run on the scratch stack"));
    }
    Ok(())
}
