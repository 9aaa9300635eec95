// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dynamically sized calls.
//!
//! `invoke` calls a target with an argument frame whose size is only known
//! at run time. The frame is rounded up to a power-of-two bucket between
//! 32 bytes and 1 GiB, so each bucket has one fixed-size frame path. After
//! the call the result bytes are copied back into the caller's buffer. If
//! the results may hold references, each pointer word goes through the
//! collector's write barrier first.

use std::mem::size_of;
use std::slice;

use crate::error::{fatal, Violation};
use crate::memory;

const WORD: usize = size_of::<usize>();

/// Smallest frame bucket.
pub const MIN_FRAME: usize = 32;
/// Largest frame bucket. Bigger argument blocks are rejected.
pub const MAX_FRAME: usize = 1 << 30;
/// Buckets up to this size use a frame on the native stack.
pub const STACK_FRAME_LIMIT: usize = 4096;

/// Every bucket, smallest first.
pub const BUCKETS: [usize; 26] = {
    let mut b = [0; 26];
    let mut i = 0;
    while i < b.len() {
        b[i] = MIN_FRAME << i;
        i += 1;
    }
    b
};

/// The smallest bucket that holds `size` bytes.
pub fn bucket_for(size: usize) -> Result<usize, Violation> {
    if size > MAX_FRAME {
        return Err(Violation::FrameTooLarge {
            size,
            max: MAX_FRAME,
        });
    }
    Ok(size.max(MIN_FRAME).next_power_of_two())
}

/// A call target operating on a raw argument frame.
pub trait FrameFn {
    fn call(&self, frame: &mut [u8]);
}

impl<F: Fn(&mut [u8])> FrameFn for F {
    fn call(&self, frame: &mut [u8]) {
        self(frame)
    }
}

/// Size and pointer layout of a value, one bit per word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    size: usize,
    bitmap: Vec<u64>,
}

impl TypeDescriptor {
    /// A pointer-free value of `size` bytes.
    pub fn scalar(size: usize) -> Self {
        Self {
            size,
            bitmap: vec![0; size.div_ceil(WORD).div_ceil(64)],
        }
    }

    /// A value whose words at `pointer_words` hold references.
    pub fn with_pointers(size: usize, pointer_words: &[usize]) -> Self {
        let mut desc = Self::scalar(size);
        for &w in pointer_words {
            assert!((w + 1) * WORD <= size, "pointer word {w} outside a {size}-byte value");
            desc.bitmap[w / 64] |= 1 << (w % 64);
        }
        desc
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_pointer(&self, word: usize) -> bool {
        self.bitmap
            .get(word / 64)
            .is_some_and(|bits| bits & (1 << (word % 64)) != 0)
    }

    /// Word indices that hold references.
    pub fn pointer_words(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(i, &bits)| {
            let mut bits = bits;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let b = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + b)
            })
        })
    }
}

/// The collector's hook for reference stores.
pub trait WriteBarrier {
    /// Called before `slot` is overwritten: it held `old`, it will hold
    /// `new`. `slot` may be unaligned and must not be written here.
    fn write_pointer(&self, slot: *mut usize, old: usize, new: usize);
}

/// Proof that results can be copied without barriers.
#[derive(Debug)]
pub struct UnscannedResults {
    _proof: (),
}

impl UnscannedResults {
    /// # Safety
    ///
    /// The destination buffer must not be reachable by the collector, or the
    /// result words must contain no references, for every call this token is
    /// used with.
    pub unsafe fn assume() -> Self {
        Self { _proof: () }
    }
}

/// How results travel back into the argument buffer.
pub enum ResultCopy<'a> {
    Barriered {
        desc: &'a TypeDescriptor,
        barrier: &'a dyn WriteBarrier,
    },
    Unscanned(UnscannedResults),
}

/// Call `target` with a zeroed frame holding a copy of `args`, then copy
/// frame bytes `[result_offset, args.len())` back into `args`. Returns the
/// bucket used.
pub fn try_invoke(
    target: &dyn FrameFn,
    args: &mut [u8],
    result_offset: usize,
    copy: ResultCopy<'_>,
) -> Result<usize, Violation> {
    let bucket = bucket_for(args.len())?;
    if result_offset > args.len() {
        return Err(Violation::ResultOffset {
            offset: result_offset,
            size: args.len(),
        });
    }
    if let ResultCopy::Barriered { desc, .. } = &copy {
        check_pointer_words(desc, result_offset, args.len())?;
    }
    match bucket {
        32 => on_stack::<{ 32 / WORD }>(target, args, result_offset, &copy),
        64 => on_stack::<{ 64 / WORD }>(target, args, result_offset, &copy),
        128 => on_stack::<{ 128 / WORD }>(target, args, result_offset, &copy),
        256 => on_stack::<{ 256 / WORD }>(target, args, result_offset, &copy),
        512 => on_stack::<{ 512 / WORD }>(target, args, result_offset, &copy),
        1024 => on_stack::<{ 1024 / WORD }>(target, args, result_offset, &copy),
        2048 => on_stack::<{ 2048 / WORD }>(target, args, result_offset, &copy),
        4096 => on_stack::<{ 4096 / WORD }>(target, args, result_offset, &copy),
        _ => {
            let mut frame = vec![0u64; bucket / 8];
            call_in(target, words_as_bytes(&mut frame), args, result_offset, &copy);
        }
    }
    Ok(bucket)
}

/// Every pointer word of `desc` must lie wholly inside or wholly outside
/// the copied range `[offset, end)`.
fn check_pointer_words(desc: &TypeDescriptor, offset: usize, end: usize) -> Result<(), Violation> {
    for w in desc.pointer_words() {
        let start = w * WORD;
        let stop = start + WORD;
        let splits_offset = start < offset && offset < stop;
        let splits_end = start < end && end < stop;
        if splits_offset || splits_end {
            return Err(Violation::ResultSplitsPointer { word: w, offset, end });
        }
    }
    Ok(())
}

/// [`try_invoke`], with an oversized frame or bad offset fatal.
pub fn invoke(target: &dyn FrameFn, args: &mut [u8], result_offset: usize, copy: ResultCopy<'_>) -> usize {
    try_invoke(target, args, result_offset, copy).unwrap_or_else(|v| fatal(v))
}

#[inline(never)]
fn on_stack<const N: usize>(target: &dyn FrameFn, args: &mut [u8], result_offset: usize, copy: &ResultCopy<'_>) {
    let mut frame = [0u64; N];
    call_in(target, words_as_bytes(&mut frame), args, result_offset, copy);
}

fn words_as_bytes(words: &mut [u64]) -> &mut [u8] {
    // SAFETY: u64 has no padding and u8 has alignment 1.
    unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), words.len() * 8) }
}

fn call_in(target: &dyn FrameFn, frame: &mut [u8], args: &mut [u8], result_offset: usize, copy: &ResultCopy<'_>) {
    let n = args.len();
    frame[..n].copy_from_slice(args);
    target.call(frame);

    if let ResultCopy::Barriered { desc, barrier } = copy {
        for w in desc.pointer_words() {
            let start = w * WORD;
            if start < result_offset {
                continue;
            }
            if start >= n {
                break;
            }
            let old = read_word(&args[start..]);
            let new = read_word(&frame[start..]);
            let slot = args[start..].as_mut_ptr().cast::<usize>();
            barrier.write_pointer(slot, old, new);
        }
    }
    let len = n - result_offset;
    // SAFETY: both ranges are in bounds of their slices and the two slices
    // are distinct buffers.
    unsafe {
        memory::copy(
            args.as_mut_ptr().add(result_offset),
            frame.as_ptr().add(result_offset),
            len,
        )
    };
}

fn read_word(bytes: &[u8]) -> usize {
    let mut raw = [0u8; WORD];
    raw.copy_from_slice(&bytes[..WORD]);
    usize::from_ne_bytes(raw)
}
