// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-direction packet buffer pools.
//!
//! The bytes live in a [`BufferArena`] carved once at init; the arena never
//! changes afterwards and can be read outside any critical section by
//! whoever owns a buffer. Ownership itself is tracked by a
//! [`RingBufferPool`], which sits under the ring's interrupt lock.

use alloc::{vec, vec::Vec};

use dmaerrno::{DmaError, DmaResult, dma_err, ensure};
use isadma::{DmaRegion, PhysAddr, SafetyChecker, region::Slot, translate::PageLock};
use log::error;

/// Bytes per ring buffer. Holds a maximum-size frame plus slack.
pub const RING_BUFFER_SIZE: u32 = 1600;

/// Handle to one buffer of an arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BufId(u16);

impl BufId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

struct ArenaBuffer {
    slot: Slot,
    phys: PhysAddr,
}

/// Backing memory of one pool, validated once.
pub struct BufferArena {
    region: DmaRegion,
    buffers: Vec<ArenaBuffer>,
}

impl BufferArena {
    /// Carve `count` buffers out of `region`.
    ///
    /// Every buffer must pass the safety check; pins taken on the way are
    /// pushed onto `pins`, whether or not carving succeeds.
    pub fn new(
        region: DmaRegion,
        count: usize,
        align: u32,
        checker: &SafetyChecker,
        pins: &mut Vec<PageLock>,
    ) -> DmaResult<Self> {
        ensure!(
            count != 0 && count <= u16::MAX as usize,
            dma_err!(InvalidParameter, "ring pool size")
        );
        let slots = region.carve(count, RING_BUFFER_SIZE, align)?;
        let mut buffers = Vec::with_capacity(count);
        for slot in slots {
            let linear = region.linear_at(slot.offset);
            let mut verdict = checker.check(linear, slot.size);
            if verdict.needs_bounce {
                checker.release(&mut verdict);
                error!(
                    "corkscrew: ring buffer at {:#X} is not DMA safe",
                    linear.as_u32()
                );
                return dma_err!(SafetyViolation, "ring buffer unreachable");
            }
            if let Some(pin) = verdict.lock.take() {
                pins.push(pin);
            }
            buffers.push(ArenaBuffer {
                slot,
                phys: verdict.phys,
            });
        }
        Ok(Self { region, buffers })
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn phys(&self, id: BufId) -> PhysAddr {
        self.buffers[id.index()].phys
    }

    /// Bytes of buffer `id`.
    ///
    /// # Safety
    ///
    /// The caller must own `id` (allocated from the matching pool and not
    /// bound to a slot the adapter is still working on).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, id: BufId) -> &mut [u8] {
        unsafe { self.region.slot_mut(&self.buffers[id.index()].slot) }
    }

    /// Number of buffers whose guard words have been overwritten.
    pub fn damaged(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| !self.region.guards_intact(&b.slot))
            .count()
    }
}

/// Allocation state of one pool.
///
/// Buffers beyond `pool_size` exist in the arena but are disabled until the
/// pool is expanded.
pub struct RingBufferPool {
    enabled: Vec<bool>,
    in_use: Vec<bool>,
    pool_size: u32,
    allocated: u32,
    max_allocation: u32,
    /// Ring size; the pool never shrinks below it.
    min_size: u32,
    expand_increment: u32,
    /// Allocation count below which the pool counts as underused.
    shrink_threshold: u32,
    auto_expand: bool,
}

impl RingBufferPool {
    /// `initial` buffers enabled out of `capacity`, for a ring of `ring_size`.
    pub fn new(initial: u32, capacity: u32, ring_size: u32, auto_expand: bool) -> Self {
        let initial = initial.min(capacity);
        let mut enabled = vec![false; capacity as usize];
        enabled[..initial as usize].fill(true);
        Self {
            enabled,
            in_use: vec![false; capacity as usize],
            pool_size: initial,
            allocated: 0,
            max_allocation: 0,
            min_size: ring_size,
            expand_increment: (ring_size / 2).max(1),
            shrink_threshold: initial / 4,
            auto_expand,
        }
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn available(&self) -> u32 {
        self.pool_size - self.allocated
    }

    pub fn max_allocation(&self) -> u32 {
        self.max_allocation
    }

    pub fn expand_increment(&self) -> u32 {
        self.expand_increment
    }

    pub fn shrink_threshold(&self) -> u32 {
        self.shrink_threshold
    }

    pub fn auto_expand(&self) -> bool {
        self.auto_expand
    }

    pub fn is_allocated(&self, id: BufId) -> bool {
        self.in_use.get(id.index()).copied().unwrap_or(false)
    }

    /// Claim the first free enabled buffer.
    pub fn alloc(&mut self) -> Option<BufId> {
        let index = self
            .enabled
            .iter()
            .zip(&self.in_use)
            .position(|(&on, &used)| on && !used)?;
        self.in_use[index] = true;
        self.allocated += 1;
        self.max_allocation = self.max_allocation.max(self.allocated);
        Some(BufId(index as u16))
    }

    /// Return `id`. `false` if it was not allocated.
    pub fn free(&mut self, id: BufId) -> bool {
        match self.in_use.get_mut(id.index()) {
            Some(used) if *used => {
                *used = false;
                self.allocated -= 1;
                true
            }
            _ => false,
        }
    }

    /// Enable `count` more buffers from the arena's reserve.
    ///
    /// Runs under the ring lock, so failures are returned without logging.
    pub fn expand(&mut self, count: u32) -> DmaResult<u32> {
        if count == 0 {
            return Err(DmaError::InvalidParameter);
        }
        if !self.auto_expand {
            return Err(DmaError::InvalidState);
        }
        let reserve = self.enabled.iter().filter(|on| !**on).count() as u32;
        if reserve < count {
            return Err(DmaError::ResourceExhausted);
        }
        self.enabled
            .iter_mut()
            .filter(|on| !**on)
            .take(count as usize)
            .for_each(|on| *on = true);
        self.pool_size += count;
        self.shrink_threshold = self.pool_size / 4;
        Ok(self.pool_size)
    }

    /// Disable `count` idle buffers. Never goes below the ring size.
    pub fn shrink(&mut self, count: u32) -> DmaResult<u32> {
        if count == 0 || self.pool_size < self.min_size + count {
            return Err(DmaError::InvalidParameter);
        }
        let idle = self
            .enabled
            .iter()
            .zip(&self.in_use)
            .filter(|(on, used)| **on && !**used)
            .count() as u32;
        if idle < count {
            return Err(DmaError::InvalidState);
        }

        let mut left = count;
        // Highest buffers go first.
        for (on, used) in self.enabled.iter_mut().zip(&self.in_use).rev() {
            if left == 0 {
                break;
            }
            if *on && !*used {
                *on = false;
                left -= 1;
            }
        }
        self.pool_size -= count;
        self.shrink_threshold = self.pool_size / 4;
        Ok(self.pool_size)
    }

    /// More than 80 % of the pool is out.
    pub fn needs_expansion(&self) -> bool {
        self.auto_expand && self.pool_size != 0 && self.allocated * 100 / self.pool_size > 80
    }

    /// Less than 25 % of the pool is out and there is room above the ring size.
    pub fn can_shrink(&self) -> bool {
        self.pool_size > self.min_size && self.allocated * 100 / self.pool_size < 25
    }

    /// Return every buffer to the free state.
    pub(crate) fn reset(&mut self) -> u32 {
        let freed = self.allocated;
        self.in_use.fill(false);
        self.allocated = 0;
        freed
    }
}
