// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Growable, relocatable frame stacks.
//!
//! A task's call frames live here rather than on its native stack, because
//! every frame carries a pointer map and can therefore be moved. Layout of
//! one frame, growing down from `hi`:
//!
//! ```text
//!   fp + 0   link      caller's frame address (0 for the bottom frame)
//!   fp + 8   argp      address in the caller's frame this call reports to
//!   fp + 16  words     number of locals
//!   fp + 24  ptrmask   bit i set: local i holds a frame-stack address
//!   fp + 32  locals[0..words]
//! ```
//!
//! When a push would cross the guard threshold the stack grows: a region at
//! least twice the size is allocated, the live bytes are copied to the same
//! distance from the new top, and every link, argp and flagged local that
//! pointed into the old region is shifted by the distance between the two
//! tops.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use crate::error::{fatal, StackError, Violation};
use crate::memory;
use crate::stack::{StackAllocator, StackRegion};

const WORD: usize = size_of::<usize>();

const LINK: usize = 0;
const ARGP: usize = WORD;
const WORDS: usize = 2 * WORD;
const MASK: usize = 3 * WORD;

/// Bytes of per-frame header preceding the locals.
pub const HEADER_BYTES: usize = 4 * WORD;

/// Locals per frame; one pointer-map bit each.
pub const MAX_LOCALS: usize = 64;

/// Shape of a frame: local count and which locals are stack addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameLayout {
    pub words: usize,
    pub pointers: u64,
}

impl FrameLayout {
    pub const fn new(words: usize) -> Self {
        Self { words, pointers: 0 }
    }

    /// Mark local `slot` as holding a frame-stack address.
    pub const fn with_pointer(mut self, slot: usize) -> Self {
        assert!(slot < MAX_LOCALS, "pointer slot out of range: frames have at most 64 locals");
        self.pointers |= 1 << slot;
        self
    }

    /// Bytes the frame occupies, header included.
    pub const fn bytes(&self) -> usize {
        HEADER_BYTES + self.words * WORD
    }
}

/// An address inside a frame stack. Only valid until the next growth,
/// unless it is stored in a slot the pointer map covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackAddr(pub usize);

impl StackAddr {
    pub const NULL: StackAddr = StackAddr(0);

    pub fn offset(self, bytes: usize) -> StackAddr {
        StackAddr(self.0 + bytes)
    }
}

/// What one growth did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthReport {
    pub old_size: usize,
    pub new_size: usize,
    pub copied: usize,
    pub adjusted: usize,
    pub old_bounds: StackRegion,
    pub new_bounds: StackRegion,
}

impl GrowthReport {
    /// Where an address taken before the growth lives now. Addresses
    /// outside the old region are returned unchanged.
    pub fn relocate(&self, addr: StackAddr) -> StackAddr {
        if self.old_bounds.contains(addr.0) {
            StackAddr(addr.0.wrapping_sub(self.old_bounds.hi).wrapping_add(self.new_bounds.hi))
        } else {
            addr
        }
    }
}

pub struct FrameStack {
    region: StackRegion,
    sp: usize,
    fp: usize,
    depth: usize,
    guard: usize,
    max: usize,
    growths: u32,
    allocator: Arc<dyn StackAllocator>,
}

// SAFETY: the region is exclusively owned; raw addresses are plain data.
unsafe impl Send for FrameStack {}

impl FrameStack {
    /// A `size`-byte stack that refuses to grow past `max` and keeps
    /// `guard` bytes above its low bound free of frames.
    pub fn new(
        allocator: Arc<dyn StackAllocator>,
        size: usize,
        max: usize,
        guard: usize,
    ) -> Result<Self, StackError> {
        let region = allocator.allocate_stack(size)?;
        Ok(Self {
            region,
            sp: region.hi,
            fp: 0,
            depth: 0,
            guard,
            max,
            growths: 0,
            allocator,
        })
    }

    pub fn bounds(&self) -> StackRegion {
        self.region
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Bytes currently occupied by frames.
    pub fn used(&self) -> usize {
        self.region.hi - self.sp
    }

    pub fn sp(&self) -> StackAddr {
        StackAddr(self.sp)
    }

    pub fn fp(&self) -> StackAddr {
        StackAddr(self.fp)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn growths(&self) -> u32 {
        self.growths
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Whether `bytes` more fit above the guard threshold.
    pub fn has_room(&self, bytes: usize) -> bool {
        self.sp
            .checked_sub(bytes)
            .is_some_and(|sp| sp >= self.region.lo + self.guard)
    }

    /// Push a frame whose results go to `argp` (or `StackAddr::NULL`).
    /// Locals start zeroed.
    pub fn push(&mut self, layout: FrameLayout, argp: StackAddr) -> Result<(), Violation> {
        if layout.words > MAX_LOCALS {
            return Err(Violation::FrameTooWide {
                words: layout.words,
            });
        }
        let bytes = layout.bytes();
        if !self.has_room(bytes) {
            return Err(Violation::GuardBreached { needed: bytes });
        }
        let frame = self.sp - bytes;
        // SAFETY: [frame, sp) lies inside the region above the guard.
        unsafe {
            write_word(frame + LINK, self.fp);
            write_word(frame + ARGP, argp.0);
            write_word(frame + WORDS, layout.words);
            write_word(frame + MASK, layout.pointers as usize);
            memory::clear((frame + HEADER_BYTES) as *mut u8, layout.words * WORD);
        }
        self.sp = frame;
        self.fp = frame;
        self.depth += 1;
        Ok(())
    }

    /// Discard the current frame.
    pub fn pop(&mut self) -> Result<(), Violation> {
        if self.fp == 0 {
            return Err(Violation::EmptyFrameStack);
        }
        // SAFETY: fp addresses a live frame header.
        let (link, words) = unsafe { (read_word(self.fp + LINK), read_word(self.fp + WORDS)) };
        self.sp = self.fp + HEADER_BYTES + words * WORD;
        self.fp = link;
        self.depth -= 1;
        Ok(())
    }

    fn current_words(&self) -> Result<usize, Violation> {
        if self.fp == 0 {
            return Err(Violation::EmptyFrameStack);
        }
        // SAFETY: fp addresses a live frame header.
        Ok(unsafe { read_word(self.fp + WORDS) })
    }

    /// Address of local `slot` of the current frame.
    pub fn slot_addr(&self, slot: usize) -> Result<StackAddr, Violation> {
        let words = self.current_words()?;
        if slot >= words {
            return Err(Violation::SlotOutOfRange { slot, words });
        }
        Ok(StackAddr(self.fp + HEADER_BYTES + slot * WORD))
    }

    pub fn local(&self, slot: usize) -> Result<usize, Violation> {
        let addr = self.slot_addr(slot)?;
        // SAFETY: slot_addr checked the slot against the live frame.
        Ok(unsafe { read_word(addr.0) })
    }

    pub fn set_local(&mut self, slot: usize, value: usize) -> Result<(), Violation> {
        let addr = self.slot_addr(slot)?;
        // SAFETY: slot_addr checked the slot against the live frame.
        unsafe { write_word(addr.0, value) };
        Ok(())
    }

    /// The current frame's result address.
    pub fn argp(&self) -> Result<StackAddr, Violation> {
        if self.fp == 0 {
            return Err(Violation::EmptyFrameStack);
        }
        // SAFETY: fp addresses a live frame header.
        Ok(StackAddr(unsafe { read_word(self.fp + ARGP) }))
    }

    /// `addr` must be an aligned local slot of a live frame; frame headers
    /// are never addressable.
    fn check(&self, addr: StackAddr) -> Result<usize, Violation> {
        let a = addr.0;
        let escaped = Err(Violation::EscapedStackPointer { addr: a });
        if a < self.sp || a >= self.region.hi || a % WORD != 0 {
            return escaped;
        }
        // Callers sit above callees, so walk up from the current frame.
        let mut frame = self.fp;
        while frame != 0 && frame <= a {
            // SAFETY: `frame` follows the live chain from fp.
            let (link, words) = unsafe { (read_word(frame + LINK), read_word(frame + WORDS)) };
            let locals = frame + HEADER_BYTES;
            if a < locals {
                return escaped;
            }
            if a < locals + words * WORD {
                return Ok(a);
            }
            frame = link;
        }
        escaped
    }

    pub fn try_load(&self, addr: StackAddr) -> Result<usize, Violation> {
        let a = self.check(addr)?;
        // SAFETY: a is an aligned address inside the live range.
        Ok(unsafe { read_word(a) })
    }

    pub fn try_store(&mut self, addr: StackAddr, value: usize) -> Result<(), Violation> {
        let a = self.check(addr)?;
        // SAFETY: a is an aligned address inside the live range.
        unsafe { write_word(a, value) };
        Ok(())
    }

    /// Read a word through a stack address. An address outside the live
    /// frames is fatal.
    pub fn load(&self, addr: StackAddr) -> usize {
        self.try_load(addr).unwrap_or_else(|v| fatal(v))
    }

    pub fn store(&mut self, addr: StackAddr, value: usize) {
        self.try_store(addr, value).unwrap_or_else(|v| fatal(v))
    }

    /// Move to a larger region with at least `needed` bytes free above the
    /// guard, relocating every self-reference. Reached only through
    /// `Worker::grow_frames`, on the system stack.
    pub(crate) fn grow(&mut self, needed: usize) -> Result<GrowthReport, Violation> {
        let old = self.region;
        let used = self.used();
        let want = needed.saturating_add(self.guard);
        let mut new_size = old.size().saturating_mul(2);
        while new_size - used < want {
            new_size = new_size.saturating_mul(2);
            if new_size > self.max {
                break;
            }
        }
        if new_size > self.max {
            return Err(Violation::StackOverflow {
                requested: new_size,
                max: self.max,
            });
        }
        let new = self
            .allocator
            .allocate_stack(new_size)
            .map_err(Violation::OutOfMemory)?;

        let new_sp = new.hi - used;
        // SAFETY: the live bytes [sp, hi) of the old region fit exactly
        // below the new top; the regions are distinct allocations.
        unsafe { memory::copy(new_sp as *mut u8, self.sp as *const u8, used) };

        let delta = new.hi.wrapping_sub(old.hi);
        let relocate = |v: usize| old.contains(v).then(|| v.wrapping_add(delta));
        let mut adjusted = 0;
        let mut frame = relocate(self.fp).unwrap_or(0);
        while frame != 0 {
            // SAFETY: `frame` is a relocated header inside the new region;
            // the chain was valid in the old region and was copied intact.
            unsafe {
                let link = read_word(frame + LINK);
                let next = relocate(link);
                if let Some(l) = next {
                    write_word(frame + LINK, l);
                    adjusted += 1;
                }
                if let Some(a) = relocate(read_word(frame + ARGP)) {
                    write_word(frame + ARGP, a);
                    adjusted += 1;
                }
                let words = read_word(frame + WORDS);
                let mut mask = read_word(frame + MASK) as u64;
                while mask != 0 {
                    let slot = mask.trailing_zeros() as usize;
                    mask &= mask - 1;
                    if slot >= words {
                        break;
                    }
                    let at = frame + HEADER_BYTES + slot * WORD;
                    if let Some(p) = relocate(read_word(at)) {
                        write_word(at, p);
                        adjusted += 1;
                    }
                }
                frame = next.unwrap_or(0);
            }
        }

        self.sp = new_sp;
        if self.fp != 0 {
            self.fp = self.fp.wrapping_add(delta);
        }
        self.region = new;
        self.allocator.free_stack(old);
        self.growths += 1;

        let report = GrowthReport {
            old_size: old.size(),
            new_size,
            copied: used,
            adjusted,
            old_bounds: old,
            new_bounds: new,
        };
        tracing::debug!(
            old_size = report.old_size,
            new_size = report.new_size,
            copied = report.copied,
            adjusted = report.adjusted,
            "frame stack grown"
        );
        Ok(report)
    }
}

impl fmt::Debug for FrameStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStack")
            .field("region", &self.region)
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("fp", &format_args!("{:#x}", self.fp))
            .field("depth", &self.depth)
            .field("growths", &self.growths)
            .finish()
    }
}

impl Drop for FrameStack {
    fn drop(&mut self) {
        self.allocator.free_stack(self.region);
    }
}

#[inline(always)]
unsafe fn read_word(addr: usize) -> usize {
    (addr as *const usize).read()
}

#[inline(always)]
unsafe fn write_word(addr: usize, value: usize) {
    (addr as *mut usize).write(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::HeapAllocator;

    const GUARD: usize = 64;

    fn stack(size: usize, max: usize) -> FrameStack {
        FrameStack::new(Arc::new(HeapAllocator), size, max, GUARD).unwrap()
    }

    #[test]
    fn push_pop_and_locals() {
        let mut fs = stack(1024, 4096);
        fs.push(FrameLayout::new(3), StackAddr::NULL).unwrap();
        assert_eq!(fs.depth(), 1);
        assert_eq!(fs.local(2).unwrap(), 0);
        fs.set_local(2, 77).unwrap();
        assert_eq!(fs.local(2).unwrap(), 77);
        assert_eq!(
            fs.local(3),
            Err(Violation::SlotOutOfRange { slot: 3, words: 3 })
        );

        fs.push(FrameLayout::new(1), StackAddr::NULL).unwrap();
        fs.pop().unwrap();
        assert_eq!(fs.local(2).unwrap(), 77);
        fs.pop().unwrap();
        assert_eq!(fs.used(), 0);
        assert_eq!(fs.pop(), Err(Violation::EmptyFrameStack));
    }

    #[test]
    fn push_respects_guard_and_width() {
        let mut fs = stack(256, 4096);
        assert_eq!(
            fs.push(FrameLayout::new(65), StackAddr::NULL),
            Err(Violation::FrameTooWide { words: 65 })
        );
        // 256 - 64 guard leaves 192 bytes: one 20-word frame (192) fits.
        fs.push(FrameLayout::new(20), StackAddr::NULL).unwrap();
        assert!(!fs.has_room(8));
        assert_eq!(
            fs.push(FrameLayout::new(0), StackAddr::NULL),
            Err(Violation::GuardBreached {
                needed: HEADER_BYTES
            })
        );
    }

    #[test]
    fn addresses_outside_live_frames_are_rejected() {
        let mut fs = stack(512, 4096);
        fs.push(FrameLayout::new(2), StackAddr::NULL).unwrap();
        let slot = fs.slot_addr(1).unwrap();
        fs.try_store(slot, 5).unwrap();
        assert_eq!(fs.try_load(slot).unwrap(), 5);
        let below = StackAddr(fs.sp().0 - WORD);
        assert_eq!(
            fs.try_load(below),
            Err(Violation::EscapedStackPointer { addr: below.0 })
        );
        assert!(fs.try_load(slot.offset(1)).is_err());
        assert!(fs.try_load(StackAddr(fs.bounds().hi)).is_err());
    }

    #[test]
    fn frame_headers_are_not_addressable() {
        let mut fs = stack(512, 4096);
        fs.push(FrameLayout::new(2), StackAddr::NULL).unwrap();
        let caller_slot = fs.slot_addr(1).unwrap();
        fs.push(FrameLayout::new(1), caller_slot).unwrap();
        for word in 0..HEADER_BYTES / WORD {
            let header = fs.fp().offset(word * WORD);
            assert_eq!(
                fs.try_store(header, 0x10),
                Err(Violation::EscapedStackPointer { addr: header.0 })
            );
        }
        // The caller's header sits between the two frames' locals.
        let caller_header = StackAddr(fs.slot_addr(0).unwrap().0 + WORD);
        assert!(fs.try_load(caller_header).is_err());
        fs.try_store(caller_slot, 6).unwrap();
        fs.try_store(fs.slot_addr(0).unwrap(), 5).unwrap();

        fs.pop().unwrap();
        assert_eq!(fs.depth(), 1);
        assert_eq!(fs.local(1).unwrap(), 6);
        fs.pop().unwrap();
        assert_eq!(fs.used(), 0);
    }

    #[test]
    fn growth_report_relocates_old_addresses_only() {
        let mut fs = stack(256, 1 << 16);
        fs.push(FrameLayout::new(2), StackAddr::NULL).unwrap();
        let slot = fs.slot_addr(1).unwrap();
        let outside = StackAddr(0x1000);
        let report = fs.grow(1024).unwrap();
        assert_eq!(report.old_size, report.old_bounds.size());
        assert_eq!(report.new_bounds, fs.bounds());
        let moved = report.relocate(slot);
        assert_eq!(moved, fs.slot_addr(1).unwrap());
        assert_eq!(report.relocate(outside), outside);
        assert_eq!(report.relocate(StackAddr::NULL), StackAddr::NULL);
    }

    #[test]
    #[should_panic(expected = "pointer slot out of range")]
    fn pointer_slot_past_the_map_is_rejected() {
        let slot = std::hint::black_box(MAX_LOCALS);
        let _ = FrameLayout::new(1).with_pointer(slot);
    }

    #[test]
    fn growth_relocates_links_argp_and_flagged_locals() {
        let mut fs = stack(256, 1 << 16);
        // Caller with a result slot and a pointer to its own slot 0.
        fs.push(FrameLayout::new(3).with_pointer(1), StackAddr::NULL)
            .unwrap();
        fs.set_local(0, 1234).unwrap();
        let own = fs.slot_addr(0).unwrap();
        fs.set_local(1, own.0).unwrap();
        // Unflagged local that happens to hold a stack address: left alone.
        fs.set_local(2, own.0).unwrap();
        let result_slot = fs.slot_addr(0).unwrap();

        fs.push(FrameLayout::new(2), result_slot).unwrap();
        fs.set_local(0, 9).unwrap();

        let old_region = fs.bounds();
        let report = fs.grow(1024).unwrap();
        assert_eq!(report.old_size, 256);
        assert!(report.new_size >= 2048);
        assert_eq!(report.copied, fs.used());
        // callee link, callee argp, caller local 1.
        assert_eq!(report.adjusted, 3);
        assert_eq!(fs.growths(), 1);
        assert!(fs.has_room(1024));

        let argp = fs.argp().unwrap();
        assert!(fs.bounds().contains(argp.0));
        assert_eq!(fs.load(argp), 1234);
        fs.store(argp, 4321);
        assert_eq!(fs.local(0).unwrap(), 9);

        fs.pop().unwrap();
        assert_eq!(fs.local(0).unwrap(), 4321);
        let p = StackAddr(fs.local(1).unwrap());
        assert_eq!(fs.load(p), 4321);
        assert!(old_region.contains(fs.local(2).unwrap()));
    }

    #[test]
    fn growth_past_max_overflows() {
        let mut fs = stack(256, 512);
        fs.push(FrameLayout::new(8), StackAddr::NULL).unwrap();
        assert_eq!(
            fs.grow(4096),
            Err(Violation::StackOverflow {
                requested: 1024,
                max: 512
            })
        );
        assert_eq!(fs.size(), 256);
    }
}
