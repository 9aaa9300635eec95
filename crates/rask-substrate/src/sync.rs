// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Publication barrier.
//!
//! Some synchronization is required between initializing an object and
//! making it reachable from another worker; otherwise the initializing
//! stores and the publishing store may be reordered and a reader can follow
//! the pointer into uninitialized memory. Locks and atomic pointer writes
//! already provide this. `publication_barrier` is for the places that
//! cannot use them (allocator internals, task handoff).
//!
//! Read side: the hardware this runtime targets orders dependent loads, but
//! the Rust memory model does not promise it. A reader that loads a
//! published pointer with a relaxed load must call [`consume_barrier`]
//! before dereferencing it. On targets without dependent-load ordering this
//! is also the required hardware fence.

use std::sync::atomic::{fence, Ordering};

/// Store/store fence: every store before the barrier becomes visible to
/// other threads before any store after it.
#[inline(always)]
pub fn publication_barrier() {
    fence(Ordering::Release);
}

/// Read-side match for [`publication_barrier`]: loads after the barrier
/// observe everything published before the pointer that was just read.
#[inline(always)]
pub fn consume_barrier() {
    fence(Ordering::Acquire);
}

/// Spin-wait hint, `cycles` times.
#[inline]
pub fn proc_yield(cycles: u32) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}
