// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Address types and the fixed memory map of a real-mode PC.

use core::{fmt, ops::Range};

/// Translation granule of paging memory managers.
pub const PAGE_SIZE_4K: u32 = 0x1000;
/// Size of one bus-master address segment. Transfers may not cross it.
pub const SEGMENT_SIZE_64K: u32 = 0x1_0000;
/// Mask selecting the 64 KiB segment number of a physical address.
pub const SEGMENT_MASK: u32 = !(SEGMENT_SIZE_64K - 1);
/// First address the 24-bit ISA bus cannot reach.
pub const ISA_ADDRESS_LIMIT: u32 = 0x100_0000;
/// End of conventional memory; always resident and identity mapped.
pub const CONVENTIONAL_LIMIT: u32 = 0xA_0000;
/// End of the upper memory area (adapter ROM/RAM, UMBs).
pub const UPPER_MEMORY_LIMIT: u32 = 0x10_0000;
/// Typical EMS page frame. Bank-switched, so never a DMA target.
pub const EMS_PAGE_FRAME: Range<u32> = 0xD_0000..0xE_0000;

pub const fn floor_align(addr: u32, align: u32) -> u32 {
    addr & !(align - 1)
}

pub const fn ceil_align(addr: u32, align: u32) -> u32 {
    let mask = align - 1;
    (addr + mask) & !mask
}

pub const fn align_rem(addr: u32, align: u32) -> u32 {
    addr & (align - 1)
}

pub const fn aligned_to(addr: u32, align: u32) -> bool {
    align_rem(addr, align) == 0
}

/// Last byte of `[start, start + len)`, or `None` when `len` is zero or the
/// addition wraps the 32-bit address space.
pub const fn checked_end(start: u32, len: u32) -> Option<u32> {
    if len == 0 || start > u32::MAX - len + 1 {
        None
    } else {
        Some(start + (len - 1))
    }
}

/// Whether `[start, start + len)` touches two different 64 KiB segments.
///
/// A wrapping range is reported as crossing.
pub const fn crosses_64k(start: u32, len: u32) -> bool {
    match checked_end(start, len) {
        Some(end) => start & SEGMENT_MASK != end & SEGMENT_MASK,
        None => len != 0,
    }
}

/// Bytes left before the next 64 KiB edge.
pub const fn bytes_to_segment_end(start: u32) -> u32 {
    SEGMENT_SIZE_64K - (start & (SEGMENT_SIZE_64K - 1))
}

/// A program-visible linear address (`segment * 16 + offset` in real mode).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct LinearAddr(u32);

impl LinearAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Address `off` bytes further on, or `None` on wraparound.
    pub const fn checked_add(self, off: u32) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    pub const fn page_base(self) -> Self {
        Self(floor_align(self.0, PAGE_SIZE_4K))
    }
}

impl From<u32> for LinearAddr {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for LinearAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinearAddr")
            .field(&format_args!("{:#X}", self.0))
            .finish()
    }
}

/// A real-mode `segment:offset` pointer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FarPtr {
    pub segment: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    pub const fn linear(self) -> LinearAddr {
        LinearAddr(((self.segment as u32) << 4) + self.offset as u32)
    }
}

impl From<FarPtr> for LinearAddr {
    fn from(ptr: FarPtr) -> Self {
        ptr.linear()
    }
}

/// A bus-physical address as seen by the adapter.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn checked_add(self, off: u32) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    pub const fn page_base(self) -> Self {
        Self(floor_align(self.0, PAGE_SIZE_4K))
    }

    pub const fn is_aligned(self, align: u32) -> bool {
        aligned_to(self.0, align)
    }

    /// Memory region this address falls in.
    pub const fn region(self) -> RegionClass {
        RegionClass::of(self.0)
    }
}

impl From<u32> for PhysAddr {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#X}", self.0))
            .finish()
    }
}

/// The three memory regions of a real-mode PC, lowest first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum RegionClass {
    /// Below 640 KiB. Resident and identity mapped.
    Conventional,
    /// 640 KiB to 1 MiB: adapter space, UMBs and the EMS page frame.
    UpperMemory,
    /// Above 1 MiB (XMS).
    Extended,
}

impl RegionClass {
    pub const fn of(phys: u32) -> Self {
        if phys < CONVENTIONAL_LIMIT {
            Self::Conventional
        } else if phys < UPPER_MEMORY_LIMIT {
            Self::UpperMemory
        } else {
            Self::Extended
        }
    }
}

/// Whether a device can be pointed at this physical range at all.
///
/// The EMS page frame is bank-switched behind the device's back.
pub const fn is_bus_visible(start: u32, end: u32) -> bool {
    end < EMS_PAGE_FRAME.start || start >= EMS_PAGE_FRAME.end
}
