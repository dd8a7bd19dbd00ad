// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Backing memory for pools, carved into fixed-size guarded slots.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use dmaerrno::{DmaResult, dma_err, ensure};

use crate::addr::{LinearAddr, SEGMENT_SIZE_64K, ceil_align, crosses_64k};

/// Guard word written in front of every slot.
pub const GUARD_FRONT: u32 = 0x6DDA_6DDA;
/// Guard word written behind every slot.
pub const GUARD_REAR: u32 = 0xADD6_ADD6;
const GUARD_LEN: u32 = 4;

/// A block of DMA-capable memory with a known linear address.
///
/// The region owns its bytes for its whole lifetime; pools hand out
/// disjoint slices of it by index.
pub struct DmaRegion {
    ptr: NonNull<u8>,
    len: usize,
    linear: LinearAddr,
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate `len` zeroed bytes that the platform placed at `linear`.
    ///
    /// On bare metal the platform allocator reports where the block landed;
    /// hosted tests pick any address they want to exercise.
    pub fn new(len: usize, linear: LinearAddr) -> Self {
        Self::from_boxed(vec![0u8; len].into_boxed_slice(), linear)
    }

    /// Take ownership of an existing block located at `linear`.
    pub fn from_boxed(bytes: Box<[u8]>, linear: LinearAddr) -> Self {
        let len = bytes.len();
        let raw = Box::into_raw(bytes) as *mut u8;
        Self {
            // Box never hands out a null pointer, even for empty slices.
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            len,
            linear,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Linear address of byte `offset`.
    pub const fn linear_at(&self, offset: u32) -> LinearAddr {
        LinearAddr::new(self.linear.as_u32() + offset)
    }

    /// Split the region into `count` slots of `size` bytes.
    ///
    /// Each slot starts `align`-aligned, is framed by guard words and never
    /// straddles a 64 KiB edge. Fails when the region is too small.
    pub fn carve(&self, count: usize, size: u32, align: u32) -> DmaResult<Vec<Slot>> {
        ensure!(
            size != 0 && size <= SEGMENT_SIZE_64K && align.is_power_of_two(),
            dma_err!(InvalidParameter, "bad slot geometry")
        );
        let base = self.linear.as_u32();
        let mut slots = Vec::with_capacity(count);
        let mut cursor = 0u32;
        for _ in 0..count {
            let mut data = ceil_align(base + cursor + GUARD_LEN, align) - base;
            if crosses_64k(base + data, size) {
                let edge = ceil_align(base + data, SEGMENT_SIZE_64K) - base;
                data = ceil_align(base + edge, align) - base;
            }
            let end = data + size + GUARD_LEN;
            if end as usize > self.len {
                return dma_err!(ResourceExhausted, "region too small for slots");
            }
            let slot = Slot { offset: data, size };
            self.write_guards(&slot);
            slots.push(slot);
            cursor = end;
        }
        Ok(slots)
    }

    fn write_word(&self, offset: u32, word: u32) {
        // Only called on guard positions carved out by `carve`.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset as usize)
                .cast::<[u8; 4]>()
                .write_unaligned(word.to_le_bytes())
        }
    }

    fn read_word(&self, offset: u32) -> u32 {
        let bytes = unsafe {
            self.ptr
                .as_ptr()
                .add(offset as usize)
                .cast::<[u8; 4]>()
                .read_unaligned()
        };
        u32::from_le_bytes(bytes)
    }

    pub(crate) fn write_guards(&self, slot: &Slot) {
        self.write_word(slot.offset - GUARD_LEN, GUARD_FRONT);
        self.write_word(slot.offset + slot.size, GUARD_REAR);
    }

    /// Whether both guard words of `slot` are intact.
    pub fn guards_intact(&self, slot: &Slot) -> bool {
        self.read_word(slot.offset - GUARD_LEN) == GUARD_FRONT
            && self.read_word(slot.offset + slot.size) == GUARD_REAR
    }

    /// Shared view of a slot.
    ///
    /// # Safety
    ///
    /// No mutable view of the same slot may be alive.
    pub unsafe fn slot(&self, slot: &Slot) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self.ptr.as_ptr().add(slot.offset as usize),
                slot.size as usize,
            )
        }
    }

    /// Mutable view of a slot.
    ///
    /// # Safety
    ///
    /// The caller must be the slot's sole owner for the lifetime of the view.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, slot: &Slot) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(slot.offset as usize),
                slot.size as usize,
            )
        }
    }

    /// Raw access to the whole region, for tests that simulate stray writes.
    #[cfg(test)]
    pub(crate) fn poke(&self, offset: u32, value: u8) {
        unsafe { self.ptr.as_ptr().add(offset as usize).write(value) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// A carved slot inside a [`DmaRegion`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot {
    /// Offset of the first data byte.
    pub offset: u32,
    pub size: u32,
}
