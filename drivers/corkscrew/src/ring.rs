// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Producer/consumer bookkeeping of one descriptor ring.
//!
//! `cur` counts descriptors handed to the adapter, `dirty` counts the ones
//! taken back. Both are free-running `u16` counters; the ring size divides
//! 65536, so `counter % size` stays a valid index across wraparound. One
//! slot is always left empty so that `cur == dirty` means empty and never
//! full.
//!
//! Every method here runs inside the ring's interrupt lock: counter and
//! bitmap updates only, no logging, no allocation.

use alloc::{vec, vec::Vec};

use dmaerrno::{DmaError, DmaResult};
use isadma::{DmaDirection, PhysAddr};

use crate::{
    desc::{DescriptorTable, status},
    pool::{BufId, BufferArena, RING_BUFFER_SIZE, RingBufferPool},
    stats::RingStats,
};

/// A completed receive descriptor, copied out of the ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RxCompletion {
    pub index: usize,
    pub buf: Option<BufId>,
    pub status: u32,
}

impl RxCompletion {
    /// Frame length, or `None` when the adapter flagged an error or the
    /// length cannot be right.
    pub fn frame_len(&self) -> Option<usize> {
        let len = self.status & status::LEN_MASK;
        (self.status & status::ERROR == 0 && len != 0 && len <= RING_BUFFER_SIZE)
            .then_some(len as usize)
    }
}

/// One direction: descriptors, slot bindings, buffer pool and counters.
pub(crate) struct Lane {
    direction: DmaDirection,
    pub table: DescriptorTable,
    slots: Vec<Option<BufId>>,
    cur: u16,
    dirty: u16,
    pub pool: RingBufferPool,
    pub stats: RingStats,
}

impl Lane {
    pub fn new(direction: DmaDirection, table: DescriptorTable, pool: RingBufferPool) -> Self {
        Self {
            direction,
            slots: vec![None; table.len()],
            table,
            cur: 0,
            dirty: 0,
            pool,
            stats: RingStats::default(),
        }
    }

    pub fn size(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn cur(&self) -> u16 {
        self.cur
    }

    pub fn dirty(&self) -> u16 {
        self.dirty
    }

    fn index(&self, counter: u16) -> usize {
        counter as usize % self.slots.len()
    }

    /// Descriptors owned by the adapter.
    pub fn filled(&self) -> u16 {
        self.cur.wrapping_sub(self.dirty)
    }

    /// Descriptors that can still be produced.
    pub fn free(&self) -> u16 {
        self.size() - 1 - self.filled()
    }

    fn note_usage(&mut self) {
        let used = self.filled() as u32;
        let peak = match self.direction {
            DmaDirection::ToDevice => &mut self.stats.peak_tx_usage,
            DmaDirection::FromDevice => &mut self.stats.peak_rx_usage,
        };
        *peak = (*peak).max(used);
    }

    fn alloc(&mut self) -> Option<BufId> {
        match self.pool.alloc() {
            Some(id) => {
                self.stats.total_allocations += 1;
                Some(id)
            }
            None => {
                self.stats.allocation_failures += 1;
                self.stats.pool_exhausted += 1;
                None
            }
        }
    }

    fn recycle(&mut self, id: BufId) {
        if self.pool.free(id) {
            self.stats.total_deallocations += 1;
            self.stats.buffers_recycled += 1;
        } else {
            self.stats.deallocation_failures += 1;
        }
    }

    /// Bind fresh receive buffers until one slot is left. Returns how many
    /// were bound; an empty pool ends the pass early.
    pub fn refill(&mut self, arena: &BufferArena) -> u16 {
        let mut bound = 0;
        while self.filled() < self.size() - 1 {
            let i = self.index(self.cur);
            if self.slots[i].is_some() {
                self.cur = self.cur.wrapping_add(1);
                continue;
            }
            let Some(id) = self.alloc() else {
                self.stats.refill_failures += 1;
                break;
            };
            self.slots[i] = Some(id);
            self.table.publish(i, arena.phys(id), 0, RING_BUFFER_SIZE);
            self.cur = self.cur.wrapping_add(1);
            bound += 1;
        }
        if self.cur == self.dirty {
            self.stats.ring_empty_events += 1;
        }
        self.note_usage();
        bound
    }

    /// Claim the slot at `cur` and a buffer for it. `cur` does not move
    /// until [`Lane::publish_tx`].
    pub fn reserve_tx(&mut self) -> DmaResult<(usize, BufId)> {
        if self.free() == 0 {
            self.stats.ring_full_events += 1;
            return Err(DmaError::ResourceExhausted);
        }
        let i = self.index(self.cur);
        let id = self.alloc().ok_or(DmaError::ResourceExhausted)?;
        self.slots[i] = Some(id);
        Ok((i, id))
    }

    /// Undo a [`Lane::reserve_tx`] whose frame never made it out.
    pub fn cancel_tx(&mut self, index: usize) {
        if let Some(id) = self.slots[index].take() {
            self.recycle(id);
        }
    }

    /// Hand the reserved slot to the adapter.
    pub fn publish_tx(&mut self, index: usize, phys: PhysAddr, len: u32) {
        self.table.publish(index, phys, status::TX_INTR, len);
        self.cur = self.cur.wrapping_add(1);
        self.note_usage();
    }

    /// Take back every completed transmit descriptor, in order.
    pub fn reclaim_tx(&mut self) -> u16 {
        let mut done = 0;
        while self.dirty != self.cur {
            let i = self.index(self.dirty);
            let desc = self.table.get(i);
            if !desc.is_complete() {
                break;
            }
            if desc.has_error() {
                self.stats.tx_errors += 1;
            } else {
                self.stats.tx_packets += 1;
                self.stats.tx_bytes = self
                    .stats
                    .tx_bytes
                    .wrapping_add(desc.length & status::LEN_MASK);
            }
            if let Some(id) = self.slots[i].take() {
                self.recycle(id);
            }
            self.table.clear(i);
            self.dirty = self.dirty.wrapping_add(1);
            done += 1;
        }
        done
    }

    /// The oldest receive descriptor, if the adapter has finished it.
    pub fn peek_rx(&self) -> Option<RxCompletion> {
        if self.dirty == self.cur {
            return None;
        }
        let index = self.index(self.dirty);
        let word = self.table.status(index);
        (word & status::COMPLETE != 0).then(|| RxCompletion {
            index,
            buf: self.slots[index],
            status: word,
        })
    }

    /// Retire the descriptor returned by [`Lane::peek_rx`].
    pub fn retire_rx(&mut self, done: &RxCompletion, delivered: bool) {
        match (delivered, done.frame_len()) {
            (true, Some(len)) => {
                self.stats.rx_packets += 1;
                self.stats.rx_bytes = self.stats.rx_bytes.wrapping_add(len as u32);
            }
            _ => self.stats.rx_errors += 1,
        }
        if let Some(id) = self.slots[done.index].take() {
            self.recycle(id);
        }
        self.table.clear(done.index);
        self.dirty = self.dirty.wrapping_add(1);
    }

    /// Cross-check slot bindings against the pool. Returns the number of
    /// mismatches.
    ///
    /// A bound slot must own an allocated buffer whose address is the one
    /// programmed into its descriptor, and the pool must not count more or
    /// fewer buffers out than the ring holds.
    pub fn leaks(&self, arena: &BufferArena) -> u32 {
        let mut leaks = 0u32;
        let mut bound = 0u32;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(id) = *slot else { continue };
            bound += 1;
            if !self.pool.is_allocated(id) {
                leaks += 1;
            }
            if self.table.get(i).addr != arena.phys(id).as_u32() {
                leaks += 1;
            }
        }
        leaks + self.pool.allocated().abs_diff(bound)
    }

    /// Unbind every slot whatever the adapter thinks of it. Teardown only.
    pub fn force_cleanup(&mut self) -> u32 {
        let mut freed = 0;
        for i in 0..self.slots.len() {
            if let Some(id) = self.slots[i].take() {
                self.recycle(id);
                freed += 1;
            }
            self.table.scrub(i);
        }
        self.cur = 0;
        self.dirty = 0;
        freed
    }

    /// Counters with the pool figures filled in.
    pub fn snapshot(&self) -> RingStats {
        RingStats {
            current_allocated: self.pool.allocated(),
            max_allocated: self.pool.max_allocation(),
            ..self.stats
        }
    }

    #[cfg(test)]
    pub fn slot(&self, index: usize) -> Option<BufId> {
        self.slots[index]
    }

    #[cfg(test)]
    pub fn unbind_silently(&mut self, index: usize) -> Option<BufId> {
        self.slots[index].take()
    }
}
