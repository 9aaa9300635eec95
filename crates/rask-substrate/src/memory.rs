// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pointer-free bulk memory operations.
//!
//! Leaf primitives used by frame-stack relocation, call dispatch and the
//! allocator/collector layers above. None of them apply write barriers:
//! callers only use them on memory that holds no references the collector
//! needs to observe (freshly allocated, reused, or statically pointer-free).

use std::ptr;
use std::slice;

/// Zero `n` bytes at `dst`.
///
/// # Safety
///
/// `dst` must be valid for writes of `n` bytes and must not hold live
/// references that need a write barrier.
#[inline]
pub unsafe fn clear(dst: *mut u8, n: usize) {
    if n == 0 {
        return;
    }
    ptr::write_bytes(dst, 0, n);
}

/// Copy `n` bytes from `src` to `dst`. Regions may overlap; the result is
/// as if the bytes went through a temporary buffer.
///
/// # Safety
///
/// `src` must be valid for reads and `dst` for writes of `n` bytes.
#[inline]
pub unsafe fn copy(dst: *mut u8, src: *const u8, n: usize) {
    if n == 0 || ptr::eq(dst, src) {
        return;
    }
    ptr::copy(src, dst, n);
}

/// Byte-for-byte equality over `n` bytes.
///
/// # Safety
///
/// Both pointers must be valid for reads of `n` bytes.
#[inline]
pub unsafe fn equal_bytes(a: *const u8, b: *const u8, n: usize) -> bool {
    if n == 0 || ptr::eq(a, b) {
        return true;
    }
    slice::from_raw_parts(a, n) == slice::from_raw_parts(b, n)
}

/// Equality where the size comes from each operand's own length. Operands
/// of different sizes are never equal.
#[inline]
pub fn equal_varlen(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // SAFETY: both slices are valid for `a.len()` bytes.
    unsafe { equal_bytes(a.as_ptr(), b.as_ptr(), a.len()) }
}

/// Zero a pointer-free slice.
#[inline]
pub fn clear_slice(dst: &mut [u8]) {
    // SAFETY: the slice is valid for writes of its own length.
    unsafe { clear(dst.as_mut_ptr(), dst.len()) }
}

/// Overlap-safe move of `len` bytes inside `buf`, from `src` to `dst`.
/// Panics if either range is out of bounds.
pub fn copy_within(buf: &mut [u8], src: usize, dst: usize, len: usize) {
    assert!(src.checked_add(len).is_some_and(|end| end <= buf.len()));
    assert!(dst.checked_add(len).is_some_and(|end| end <= buf.len()));
    let base = buf.as_mut_ptr();
    // SAFETY: both ranges were bounds-checked against `buf`.
    unsafe { copy(base.add(dst), base.add(src), len) }
}

/// Offset a raw pointer by `x` bytes.
#[inline(always)]
pub fn add(p: *const u8, x: usize) -> *const u8 {
    p.wrapping_add(x)
}

/// Round `n` up to a multiple of `a`. `a` must be a power of two.
#[inline(always)]
pub const fn round_up(n: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    (n + a - 1) & !(a - 1)
}

/// Round `n` down to a multiple of `a`. `a` must be a power of two.
#[inline(always)]
pub const fn round_down(n: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    n & !(a - 1)
}
