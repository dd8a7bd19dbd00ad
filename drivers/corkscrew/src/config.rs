// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use bitflags::bitflags;
use dmaerrno::{DmaResult, dma_err, ensure};
use isadma::{AddressTranslator, DmaRegion, LinearAddr, addr::SEGMENT_SIZE_64K};

use crate::pool::RING_BUFFER_SIZE;

pub const MIN_RING_SIZE: u16 = 4;
pub const MAX_RING_SIZE: u16 = 256;
pub const DEFAULT_RING_SIZE: u16 = 16;

/// Transmit pool size, in ring sizes.
pub const TX_POOL_FACTOR: u32 = 2;
/// Receive pool size, in ring sizes.
pub const RX_POOL_FACTOR: u32 = 3;

bitflags! {
    /// Ring behaviour switches.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RingFlags: u32 {
        /// The adapter may be started.
        const DMA_ENABLED = 1 << 0;
        /// Receive reclaim refills the ring before returning.
        const AUTO_REFILL = 1 << 1;
        /// Cross-check ring and pool bookkeeping at shutdown.
        const LEAK_DETECTION = 1 << 4;
        /// Pools may grow into their reserve.
        const POOL_AUTO_EXPAND = 1 << 5;
        /// Buffers start on a 32-byte cache line instead of 16 bytes.
        const ALIGNED_BUFFERS = 1 << 7;
    }
}

impl Default for RingFlags {
    fn default() -> Self {
        let flags = Self::DMA_ENABLED
            | Self::AUTO_REFILL
            | Self::POOL_AUTO_EXPAND
            | Self::ALIGNED_BUFFERS;
        if cfg!(feature = "leak-detection") {
            flags | Self::LEAK_DETECTION
        } else {
            flags
        }
    }
}

/// Ring geometry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingConfig {
    pub tx_ring_size: u16,
    pub rx_ring_size: u16,
    pub flags: RingFlags,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            tx_ring_size: DEFAULT_RING_SIZE,
            rx_ring_size: DEFAULT_RING_SIZE,
            flags: RingFlags::default(),
        }
    }
}

fn ring_size_ok(size: u16) -> bool {
    (MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) && size.is_power_of_two()
}

/// Buffers initially enabled in a pool for a ring of `ring_size`.
pub(crate) const fn initial_pool(ring_size: u16, factor: u32) -> u32 {
    ring_size as u32 * factor
}

/// Buffers carved for a pool: the initial set plus two expansion steps.
pub(crate) const fn pool_capacity(ring_size: u16, factor: u32) -> u32 {
    let step = if ring_size >= 2 { ring_size as u32 / 2 } else { 1 };
    initial_pool(ring_size, factor) + 2 * step
}

impl RingConfig {
    /// Ring sizes must be powers of two in `4..=256`.
    pub fn validate(&self) -> DmaResult {
        ensure!(
            ring_size_ok(self.tx_ring_size) && ring_size_ok(self.rx_ring_size),
            dma_err!(InvalidParameter, "ring size must be a power of two in 4..=256")
        );
        Ok(())
    }

    pub const fn buffer_align(&self) -> u32 {
        if self.flags.contains(RingFlags::ALIGNED_BUFFERS) { 32 } else { 16 }
    }

    /// Bytes of DMA memory the transmit buffers need.
    pub const fn tx_region_len(&self) -> usize {
        region_len(pool_capacity(self.tx_ring_size, TX_POOL_FACTOR))
    }

    /// Bytes of DMA memory the receive buffers need.
    pub const fn rx_region_len(&self) -> usize {
        region_len(pool_capacity(self.rx_ring_size, RX_POOL_FACTOR))
    }
}

/// Room for `buffers` guarded, aligned buffers plus one skipped 64 KiB edge.
const fn region_len(buffers: u32) -> usize {
    ((RING_BUFFER_SIZE + 32 + 8) * buffers + SEGMENT_SIZE_64K) as usize
}

/// DMA memory the platform set aside for the rings.
pub struct RingMemory {
    pub translator: AddressTranslator,
    /// Where the transmit descriptor table sits.
    pub tx_descriptors: LinearAddr,
    pub rx_descriptors: LinearAddr,
    pub tx_buffers: DmaRegion,
    pub rx_buffers: DmaRegion,
}

impl RingMemory {
    /// Layout for a machine without paging, starting at the page-aligned
    /// `base`: both descriptor tables in the first two pages, then the
    /// transmit and receive buffers back to back.
    pub fn hosted(config: &RingConfig, base: u32) -> Self {
        let tx_len = config.tx_region_len();
        let tx_base = base + 0x2000;
        let rx_base = tx_base + tx_len as u32;
        Self {
            translator: AddressTranslator::identity(),
            tx_descriptors: LinearAddr::new(base),
            rx_descriptors: LinearAddr::new(base + 0x1000),
            tx_buffers: DmaRegion::new(tx_len, LinearAddr::new(tx_base)),
            rx_buffers: DmaRegion::new(config.rx_region_len(), LinearAddr::new(rx_base)),
        }
    }
}
