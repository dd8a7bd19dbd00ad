// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Hardware descriptor layout and the circular descriptor table.

use alloc::{boxed::Box, vec, vec::Vec};
use core::{mem::size_of, ptr};

use dmaerrno::{DmaResult, dma_err, ensure};
use isadma::{LinearAddr, PhysAddr, SafetyChecker, translate::PageLock};
use log::error;
use static_assertions::const_assert_eq;

/// Descriptor status word bits.
pub mod status {
    /// Set by the adapter when it is done with the descriptor.
    pub const COMPLETE: u32 = 0x8000_0000;
    pub const ERROR: u32 = 0x4000_0000;
    /// Ask for an interrupt when this transmit completes.
    pub const TX_INTR: u32 = 0x2000_0000;
    /// Frame length field.
    pub const LEN_MASK: u32 = 0x0000_1FFF;
}

/// One entry of an upload or download list, as the adapter reads it.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DmaDescriptor {
    /// Physical address of the next descriptor.
    pub next: u32,
    pub status: u32,
    /// Physical address of the buffer.
    pub addr: u32,
    pub length: u32,
}

const_assert_eq!(size_of::<DmaDescriptor>(), 16);

impl DmaDescriptor {
    pub const fn is_complete(&self) -> bool {
        self.status & status::COMPLETE != 0
    }

    pub const fn has_error(&self) -> bool {
        self.status & status::ERROR != 0
    }
}

/// Fixed ring of descriptors in DMA-reachable memory.
///
/// Entry `i` links to entry `i + 1`; the last one links back to the first.
pub struct DescriptorTable {
    descs: Box<[DmaDescriptor]>,
    phys: PhysAddr,
}

impl DescriptorTable {
    /// Allocate `count` linked descriptors that the platform placed at
    /// `linear`. The whole table must be directly reachable by the adapter.
    ///
    /// A pin taken on the table memory is pushed onto `pins`.
    pub fn new(
        count: u16,
        linear: LinearAddr,
        checker: &SafetyChecker,
        pins: &mut Vec<PageLock>,
    ) -> DmaResult<Self> {
        ensure!(count != 0, dma_err!(InvalidParameter, "empty descriptor table"));
        let bytes = count as u32 * size_of::<DmaDescriptor>() as u32;
        let mut verdict = checker.check(linear, bytes);
        if verdict.needs_bounce {
            checker.release(&mut verdict);
            error!(
                "corkscrew: descriptor table at {:#X}+{} is not DMA safe",
                linear.as_u32(),
                bytes
            );
            return dma_err!(SafetyViolation, "descriptor table unreachable");
        }

        if let Some(pin) = verdict.lock.take() {
            pins.push(pin);
        }
        let mut table = Self {
            descs: vec![DmaDescriptor::default(); count as usize].into_boxed_slice(),
            phys: verdict.phys,
        };
        for i in 0..table.descs.len() {
            let next = table.phys_of((i + 1) % table.descs.len());
            table.descs[i].next = next.as_u32();
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Bus address of the first descriptor, for the list pointer registers.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn phys_of(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.phys.as_u32() + (index * size_of::<DmaDescriptor>()) as u32)
    }

    /// Snapshot of entry `index` as the adapter last left it.
    pub fn get(&self, index: usize) -> DmaDescriptor {
        unsafe { ptr::read_volatile(&self.descs[index]) }
    }

    pub fn status(&self, index: usize) -> u32 {
        unsafe { ptr::read_volatile(&self.descs[index].status) }
    }

    /// Point entry `index` at a buffer. The link word is left alone.
    pub fn publish(&mut self, index: usize, addr: PhysAddr, status: u32, length: u32) {
        let d = &mut self.descs[index];
        unsafe {
            ptr::write_volatile(&mut d.addr, addr.as_u32());
            ptr::write_volatile(&mut d.length, length);
            // Status last: it hands the entry to the adapter.
            ptr::write_volatile(&mut d.status, status);
        }
    }

    /// Clear status and length after the entry has been reclaimed.
    pub fn clear(&mut self, index: usize) {
        let d = &mut self.descs[index];
        unsafe {
            ptr::write_volatile(&mut d.status, 0);
            ptr::write_volatile(&mut d.length, 0);
        }
    }

    /// Forget the buffer address as well. Only for teardown.
    pub fn scrub(&mut self, index: usize) {
        self.clear(index);
        unsafe { ptr::write_volatile(&mut self.descs[index].addr, 0) };
    }

    /// Play the adapter: mark entry `index` done with `status`.
    #[cfg(test)]
    pub fn complete(&mut self, index: usize, status: u32) {
        unsafe { ptr::write_volatile(&mut self.descs[index].status, status | status::COMPLETE) };
    }
}
