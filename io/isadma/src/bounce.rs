// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Pre-validated bounce buffers, one pool per transfer direction.

use alloc::{format, vec, vec::Vec};

use dmaerrno::{DmaError, DmaResult, dma_err, ensure};
use irqlock::IrqLock;
use log::{debug, error, info, warn};

use crate::{
    DmaDirection,
    addr::{LinearAddr, PhysAddr},
    region::{DmaRegion, Slot},
    safety::SafetyChecker,
    translate::PageLock,
};

/// Geometry of a bounce pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BouncePoolConfig {
    pub count: usize,
    pub buffer_size: u32,
    pub alignment: u32,
}

impl BouncePoolConfig {
    pub const TX_DEFAULT: Self = Self {
        count: 8,
        buffer_size: 1600,
        alignment: 16,
    };

    pub const RX_DEFAULT: Self = Self {
        count: 16,
        buffer_size: 1600,
        alignment: 16,
    };

    /// Region size that always fits this geometry, 64 KiB skips included.
    pub const fn region_len(&self) -> usize {
        let stride = self.buffer_size as usize + self.alignment as usize + 8;
        stride * self.count + 0x1_0000
    }
}

/// A pool buffer as the device sees it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BounceBuffer {
    pub linear: LinearAddr,
    pub phys: PhysAddr,
    pub size: u32,
    slot: Slot,
}

/// Exclusive claim on one bounce buffer.
///
/// Obtained from [`BouncePool::acquire`] and given back by value through
/// [`BouncePool::release`].
#[derive(Debug, Eq, PartialEq)]
pub struct BounceHandle {
    direction: DmaDirection,
    index: u16,
    len: u32,
    phys: PhysAddr,
}

impl BounceHandle {
    pub const fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Bytes requested at acquire time.
    pub const fn len(&self) -> u32 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }
}

/// Pool counters. `allocated + available == pool_size` between operations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub pool_size: u32,
    pub allocated: u32,
    pub available: u32,
    pub peak_allocated: u32,
    pub total_acquires: u32,
    pub total_releases: u32,
    pub exhaustion_events: u32,
    pub oversize_requests: u32,
    pub invalid_releases: u32,
    pub corruption_events: u32,
}

struct PoolState {
    in_use: Vec<bool>,
    stats: PoolStats,
}

/// Fixed set of DMA-safe buffers for one direction.
pub struct BouncePool {
    direction: DmaDirection,
    region: DmaRegion,
    buffers: Vec<BounceBuffer>,
    pins: Vec<PageLock>,
    state: IrqLock<PoolState>,
}

impl BouncePool {
    /// Carve `region` into buffers and validate each one once.
    ///
    /// A single unsafe buffer fails the whole pool.
    pub fn new(
        direction: DmaDirection,
        config: BouncePoolConfig,
        region: DmaRegion,
        checker: &SafetyChecker,
    ) -> DmaResult<Self> {
        ensure!(
            config.count != 0 && config.count <= u16::MAX as usize,
            dma_err!(InvalidParameter, "bounce pool size")
        );
        let slots = region.carve(config.count, config.buffer_size, config.alignment)?;

        let mut buffers = Vec::with_capacity(slots.len());
        let mut pins = Vec::new();
        for (i, slot) in slots.into_iter().enumerate() {
            let linear = region.linear_at(slot.offset);
            let mut verdict = checker.check(linear, slot.size);
            if verdict.needs_bounce {
                error!(
                    "isadma: {:?} bounce buffer {} at {:#X} is not DMA safe",
                    direction,
                    i,
                    linear.as_u32()
                );
                checker.release(&mut verdict);
                for pin in pins {
                    checker.translator().unlock(pin);
                }
                return dma_err!(SafetyViolation, "bounce pool rejected");
            }
            if let Some(pin) = verdict.lock.take() {
                pins.push(pin);
            }
            buffers.push(BounceBuffer {
                linear,
                phys: verdict.phys,
                size: slot.size,
                slot,
            });
        }

        let count = buffers.len() as u32;
        info!(
            "isadma: {:?} bounce pool ready, {} x {} bytes",
            direction, count, config.buffer_size
        );
        Ok(Self {
            direction,
            region,
            buffers,
            pins,
            state: IrqLock::new(PoolState {
                in_use: vec![false; count as usize],
                stats: PoolStats {
                    pool_size: count,
                    available: count,
                    ..PoolStats::default()
                },
            }),
        })
    }

    pub const fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffers.first().map_or(0, |b| b.size)
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Claim the first free buffer able to hold `size` bytes.
    ///
    /// Returns `None` when the request is larger than a buffer or the pool is
    /// empty; both are counted. Never blocks and never hands out a smaller
    /// buffer.
    pub fn acquire(&self, size: u32) -> Option<BounceHandle> {
        if size == 0 || size > self.buffer_size() {
            self.state.with(|s| s.stats.oversize_requests += 1);
            warn!(
                "isadma: {:?} bounce request of {} bytes exceeds {}",
                self.direction,
                size,
                self.buffer_size()
            );
            return None;
        }

        let claimed = self.state.with(|s| {
            let index = s.in_use.iter().position(|used| !used);
            match index {
                Some(i) => {
                    s.in_use[i] = true;
                    s.stats.allocated += 1;
                    s.stats.available -= 1;
                    s.stats.total_acquires += 1;
                    s.stats.peak_allocated = s.stats.peak_allocated.max(s.stats.allocated);
                }
                None => s.stats.exhaustion_events += 1,
            }
            index
        });

        match claimed {
            Some(i) => Some(BounceHandle {
                direction: self.direction,
                index: i as u16,
                len: size,
                phys: self.buffers[i].phys,
            }),
            None => {
                warn!("isadma: {:?} bounce pool exhausted", self.direction);
                None
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// A handle from another pool or for a buffer that is not checked out is
    /// logged and rejected without touching the bookkeeping. A damaged guard
    /// word is logged and counted; the buffer is still returned and the
    /// call reports [`DmaError::Corruption`].
    pub fn release(&self, handle: BounceHandle) -> DmaResult {
        let index = handle.index();
        let Some(buffer) = self.buffers.get(index) else {
            self.state.with(|s| s.stats.invalid_releases += 1);
            error!(
                "isadma: {:?} pool has no buffer {}",
                self.direction, index
            );
            return Err(DmaError::InvalidParameter);
        };
        if handle.direction != self.direction {
            self.state.with(|s| s.stats.invalid_releases += 1);
            error!(
                "isadma: {:?} handle released into the {:?} pool",
                handle.direction, self.direction
            );
            return Err(DmaError::InvalidParameter);
        }

        let intact = self.region.guards_intact(&buffer.slot);
        let released = self.state.with(|s| {
            if !s.in_use[index] {
                s.stats.invalid_releases += 1;
                return false;
            }
            s.in_use[index] = false;
            s.stats.allocated -= 1;
            s.stats.available += 1;
            s.stats.total_releases += 1;
            s.stats.corruption_events += !intact as u32;
            true
        });

        if !released {
            error!(
                "isadma: {:?} bounce buffer {} released twice",
                self.direction, index
            );
            return Err(DmaError::InvalidParameter);
        }
        if !intact {
            error!(
                "isadma: {:?} bounce buffer {} guard words overwritten",
                self.direction, index
            );
            return Err(DmaError::Corruption);
        }
        Ok(())
    }

    fn buffer_of(&self, handle: &BounceHandle) -> Option<&BounceBuffer> {
        if handle.direction != self.direction {
            return None;
        }
        self.buffers.get(handle.index())
    }

    pub fn buffer(&self, handle: &BounceHandle) -> Option<&BounceBuffer> {
        self.buffer_of(handle)
    }

    /// The requested bytes of a checked-out buffer.
    pub fn data<'a>(&'a self, handle: &'a BounceHandle) -> Option<&'a [u8]> {
        let buffer = self.buffer_of(handle)?;
        // The handle is the only claim on this slot.
        let bytes = unsafe { self.region.slot(&buffer.slot) };
        Some(&bytes[..handle.len as usize])
    }

    /// Mutable view of the requested bytes of a checked-out buffer.
    pub fn data_mut<'a>(&'a self, handle: &'a mut BounceHandle) -> Option<&'a mut [u8]> {
        let buffer = self.buffer_of(handle)?;
        let bytes = unsafe { self.region.slot_mut(&buffer.slot) };
        Some(&mut bytes[..handle.len as usize])
    }

    /// Verify every guard word; returns how many buffers are damaged.
    pub fn check_integrity(&self) -> usize {
        let damaged: Vec<usize> = self
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| !self.region.guards_intact(&b.slot))
            .map(|(i, _)| i)
            .collect();
        if !damaged.is_empty() {
            let count = damaged.len() as u32;
            self.state.with(|s| s.stats.corruption_events += count);
            error!(
                "isadma: {:?} bounce pool guard damage in buffers {}",
                self.direction,
                format!("{:?}", damaged)
            );
        } else {
            debug!("isadma: {:?} bounce pool guards intact", self.direction);
        }
        damaged.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.with(|s| s.stats)
    }

    /// Drop page pins held on the pool memory. Called once at teardown.
    pub fn release_pins(&mut self, checker: &SafetyChecker) {
        for pin in self.pins.drain(..) {
            checker.translator().unlock(pin);
        }
    }

    #[cfg(test)]
    pub(crate) fn region(&self) -> &DmaRegion {
        &self.region
    }

    #[cfg(test)]
    pub(crate) fn slot_of(&self, index: usize) -> Slot {
        self.buffers[index].slot
    }
}

/// The TX and RX pools.
pub struct BouncePools {
    pub tx: BouncePool,
    pub rx: BouncePool,
}

impl BouncePools {
    pub fn pool(&self, direction: DmaDirection) -> &BouncePool {
        match direction {
            DmaDirection::ToDevice => &self.tx,
            DmaDirection::FromDevice => &self.rx,
        }
    }

    pub fn acquire(&self, direction: DmaDirection, size: u32) -> Option<BounceHandle> {
        self.pool(direction).acquire(size)
    }

    pub fn release(&self, direction: DmaDirection, handle: BounceHandle) -> DmaResult {
        self.pool(direction).release(handle)
    }

    pub fn data<'a>(&'a self, handle: &'a BounceHandle) -> Option<&'a [u8]> {
        self.pool(handle.direction()).data(handle)
    }

    pub fn data_mut<'a>(&'a self, handle: &'a mut BounceHandle) -> Option<&'a mut [u8]> {
        self.pool(handle.direction()).data_mut(handle)
    }

    pub fn check_integrity(&self) -> usize {
        self.tx.check_integrity() + self.rx.check_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addr::LinearAddr, safety::DmaConstraints, translate::AddressTranslator};

    fn checker() -> SafetyChecker {
        SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW)
    }

    fn pool(direction: DmaDirection, count: usize) -> BouncePool {
        let config = BouncePoolConfig {
            count,
            ..BouncePoolConfig::TX_DEFAULT
        };
        let region = DmaRegion::new(config.region_len(), LinearAddr::new(0x30000));
        BouncePool::new(direction, config, region, &checker()).unwrap()
    }

    fn assert_conserved(p: &BouncePool) {
        let s = p.stats();
        assert_eq!(s.allocated + s.available, s.pool_size);
    }

    #[test]
    fn ninth_acquire_from_eight_fails() {
        let p = pool(DmaDirection::ToDevice, 8);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(p.acquire(1500).unwrap());
            assert_conserved(&p);
        }
        assert!(p.acquire(1500).is_none());
        let s = p.stats();
        assert_eq!(s.exhaustion_events, 1);
        assert_eq!(s.allocated, 8);
        assert_eq!(s.available, 0);
        for h in held {
            p.release(h).unwrap();
            assert_conserved(&p);
        }
        assert_eq!(p.stats().peak_allocated, 8);
    }

    #[test]
    fn oversize_request_is_refused() {
        let p = pool(DmaDirection::ToDevice, 2);
        assert!(p.acquire(1601).is_none());
        assert!(p.acquire(0).is_none());
        let s = p.stats();
        assert_eq!(s.oversize_requests, 2);
        assert_eq!(s.exhaustion_events, 0);
        assert_eq!(s.allocated, 0);
    }

    #[test]
    fn buffers_are_dma_safe() {
        let c = checker();
        let p = pool(DmaDirection::FromDevice, 16);
        for b in &p.buffers {
            assert!(!c.check(b.linear, b.size).needs_bounce);
        }
    }

    #[test]
    fn unsafe_region_rejects_the_pool() {
        // Above 640K nothing translates without a paging layer.
        let region = DmaRegion::new(0x2000, LinearAddr::new(0xA0000));
        let config = BouncePoolConfig {
            count: 2,
            ..BouncePoolConfig::TX_DEFAULT
        };
        assert!(matches!(
            BouncePool::new(DmaDirection::ToDevice, config, region, &checker()),
            Err(DmaError::SafetyViolation)
        ));
    }

    #[test]
    fn wrong_pool_release_keeps_bookkeeping() {
        let pools = BouncePools {
            tx: pool(DmaDirection::ToDevice, 2),
            rx: pool(DmaDirection::FromDevice, 2),
        };
        let h = pools.acquire(DmaDirection::ToDevice, 64).unwrap();
        assert_eq!(
            pools.release(DmaDirection::FromDevice, h),
            Err(DmaError::InvalidParameter)
        );
        assert_eq!(pools.rx.stats().invalid_releases, 1);
        assert_eq!(pools.rx.stats().allocated, 0);
        assert_eq!(pools.tx.stats().allocated, 1);
        assert_conserved(&pools.rx);
        assert_conserved(&pools.tx);
    }

    #[test]
    fn guard_damage_is_reported_on_release() {
        let p = pool(DmaDirection::ToDevice, 2);
        let mut h = p.acquire(16).unwrap();
        p.data_mut(&mut h).unwrap().copy_from_slice(&[0xAB; 16]);
        let slot = p.slot_of(h.index());
        p.region().poke(slot.offset + slot.size, 0x00);
        assert_eq!(p.check_integrity(), 1);
        assert_eq!(p.release(h), Err(DmaError::Corruption));
        let s = p.stats();
        assert_eq!(s.corruption_events, 2);
        assert_eq!(s.allocated, 0);
        assert_conserved(&p);
    }

    #[test]
    fn data_is_scoped_to_the_request() {
        let p = pool(DmaDirection::ToDevice, 1);
        let mut h = p.acquire(60).unwrap();
        assert_eq!(p.data_mut(&mut h).unwrap().len(), 60);
        p.data_mut(&mut h).unwrap()[59] = 7;
        assert_eq!(p.data(&h).unwrap()[59], 7);
        assert_eq!(h.phys(), p.buffer(&h).unwrap().phys);
        p.release(h).unwrap();
    }
}
