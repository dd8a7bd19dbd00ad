// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! DMA-safe buffer handling for ISA bus masters.
//!
//! An ISA bus master sees 24 address bits, cannot cross a 64 KiB physical
//! boundary in one transfer and needs physically contiguous memory. This
//! crate decides whether a buffer can be handed to the device as-is and,
//! when it cannot, provides the alternatives: splitting it into safe
//! fragments or copying it through a pre-validated bounce buffer.
//!
//! Everything hangs off an [`IsaDma`] context owned by the driver; there is
//! no global state.
//!
//! ```
//! use isadma::{DmaDirection, IsaDma, IsaDmaConfig, LinearAddr, DmaMapping};
//!
//! let dma = IsaDma::hosted(IsaDmaConfig::default(), 0x40000).unwrap();
//! let frame = [0u8; 1500];
//! let mapping = dma
//!     .map(LinearAddr::new(0x20000), &frame, DmaDirection::ToDevice)
//!     .unwrap();
//! assert!(matches!(mapping, DmaMapping::Direct { .. }));
//! dma.unmap(mapping).unwrap();
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod bounce;
pub mod region;
pub mod safety;
pub mod sg;
pub mod translate;

use alloc::vec::Vec;

use dmaerrno::{DmaError, DmaResult, dma_err, ensure};
use log::{debug, info, warn};

pub use self::{
    addr::{FarPtr, LinearAddr, PhysAddr, RegionClass},
    bounce::{BounceBuffer, BounceHandle, BouncePool, BouncePoolConfig, BouncePools, PoolStats},
    region::DmaRegion,
    safety::{BoundaryStats, DmaConstraints, SafetyChecker, SafetyVerdict},
    sg::{MAX_SG_SEGMENTS, ScatterGatherList, Segment},
    translate::{AddressTranslator, PageService, TranslationMode},
};

/// Which way the bytes move.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DmaDirection {
    /// Transmit: memory to device.
    ToDevice,
    /// Receive: device to memory.
    FromDevice,
}

/// Settings for an [`IsaDma`] context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsaDmaConfig {
    pub constraints: DmaConstraints,
    pub tx_pool: BouncePoolConfig,
    pub rx_pool: BouncePoolConfig,
    /// Fragment limit used when [`IsaDma::map`] splits a buffer.
    pub max_segments: usize,
}

impl Default for IsaDmaConfig {
    fn default() -> Self {
        Self {
            constraints: DmaConstraints::CORKSCREW,
            tx_pool: BouncePoolConfig::TX_DEFAULT,
            rx_pool: BouncePoolConfig::RX_DEFAULT,
            max_segments: MAX_SG_SEGMENTS,
        }
    }
}

/// How a buffer was made reachable by the device.
#[derive(Debug)]
#[must_use]
pub enum DmaMapping {
    /// The buffer itself is DMA safe.
    Direct {
        verdict: SafetyVerdict,
        direction: DmaDirection,
    },
    /// The buffer is described by several safe fragments.
    Split(ScatterGatherList),
    /// The data lives in a bounce buffer.
    Bounced(BounceHandle),
}

impl DmaMapping {
    pub fn direction(&self) -> DmaDirection {
        match self {
            Self::Direct { direction, .. } => *direction,
            Self::Split(list) => list.direction(),
            Self::Bounced(handle) => handle.direction(),
        }
    }

    /// `(physical address, length)` of every fragment, in buffer order.
    pub fn fragments(&self) -> Vec<(PhysAddr, u32)> {
        match self {
            Self::Direct { verdict, .. } => alloc::vec![(verdict.phys, verdict.len)],
            Self::Split(list) => list.segments().iter().map(|s| (s.phys, s.length)).collect(),
            Self::Bounced(handle) => alloc::vec![(handle.phys(), handle.len())],
        }
    }

    pub fn is_copied(&self) -> bool {
        match self {
            Self::Direct { .. } => false,
            Self::Split(list) => list.bounced_count() != 0,
            Self::Bounced(_) => true,
        }
    }
}

/// Counters of the whole context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IsaDmaStats {
    pub boundary: BoundaryStats,
    pub tx_pool: PoolStats,
    pub rx_pool: PoolStats,
}

/// Per-device DMA buffer context.
pub struct IsaDma {
    checker: SafetyChecker,
    pools: BouncePools,
    max_segments: usize,
}

impl IsaDma {
    /// Build the context, carving the bounce pools out of `tx_region` and
    /// `rx_region`.
    pub fn new(
        translator: AddressTranslator,
        config: IsaDmaConfig,
        tx_region: DmaRegion,
        rx_region: DmaRegion,
    ) -> DmaResult<Self> {
        ensure!(
            (1..=MAX_SG_SEGMENTS).contains(&config.max_segments),
            dma_err!(InvalidParameter, "fragment limit out of range")
        );
        let checker = SafetyChecker::new(translator, config.constraints);
        let tx = BouncePool::new(DmaDirection::ToDevice, config.tx_pool, tx_region, &checker)?;
        let rx = match BouncePool::new(DmaDirection::FromDevice, config.rx_pool, rx_region, &checker)
        {
            Ok(rx) => rx,
            Err(err) => {
                let mut tx = tx;
                tx.release_pins(&checker);
                return Err(err);
            }
        };
        info!(
            "isadma: context ready, {} tx and {} rx bounce buffers",
            tx.capacity(),
            rx.capacity()
        );
        Ok(Self {
            checker,
            pools: BouncePools { tx, rx },
            max_segments: config.max_segments,
        })
    }

    /// Context for a machine without a paging layer, with both pools
    /// placed back to back in conventional memory starting at `base`.
    pub fn hosted(config: IsaDmaConfig, base: u32) -> DmaResult<Self> {
        let tx_len = config.tx_pool.region_len();
        let rx_base = base + tx_len as u32;
        Self::new(
            AddressTranslator::identity(),
            config,
            DmaRegion::new(tx_len, LinearAddr::new(base)),
            DmaRegion::new(config.rx_pool.region_len(), LinearAddr::new(rx_base)),
        )
    }

    pub fn checker(&self) -> &SafetyChecker {
        &self.checker
    }

    pub fn pools(&self) -> &BouncePools {
        &self.pools
    }

    /// Full safety verdict for `[linear, linear + len)`.
    pub fn check_buffer_safety(&self, linear: LinearAddr, len: u32) -> SafetyVerdict {
        self.checker.check(linear, len)
    }

    /// Drop the page pin a verdict from [`IsaDma::check_buffer_safety`]
    /// may hold.
    pub fn release_verdict(&self, verdict: &mut SafetyVerdict) {
        self.checker.release(verdict)
    }

    pub fn acquire_bounce_buffer(&self, direction: DmaDirection, size: u32) -> Option<BounceHandle> {
        let handle = self.pools.acquire(direction, size)?;
        self.record_bounce(direction);
        Some(handle)
    }

    pub fn release_bounce_buffer(&self, direction: DmaDirection, handle: BounceHandle) -> DmaResult {
        self.pools.release(direction, handle)
    }

    pub fn bounce_data<'a>(&'a self, handle: &'a BounceHandle) -> Option<&'a [u8]> {
        self.pools.data(handle)
    }

    pub fn bounce_data_mut<'a>(&'a self, handle: &'a mut BounceHandle) -> Option<&'a mut [u8]> {
        self.pools.data_mut(handle)
    }

    pub fn build_scatter_gather(
        &self,
        data: &[u8],
        linear: LinearAddr,
        direction: DmaDirection,
        max_segments: usize,
    ) -> DmaResult<ScatterGatherList> {
        ScatterGatherList::build(&self.checker, &self.pools, data, linear, direction, max_segments)
    }

    pub fn release_scatter_gather(&self, list: ScatterGatherList) -> DmaResult {
        list.release(&self.checker, &self.pools)
    }

    /// Make `data`, located at `linear`, reachable by the device.
    ///
    /// Tries the buffer itself, then a split into safe fragments, then one
    /// bounce buffer. Outgoing data is already copied when this returns.
    /// An untranslatable address fails with `TranslationFailure`; nothing
    /// can be copied from memory whose location is unknown.
    pub fn map(&self, linear: LinearAddr, data: &[u8], direction: DmaDirection) -> DmaResult<DmaMapping> {
        let Ok(len) = u32::try_from(data.len()) else {
            return dma_err!(InvalidParameter, "buffer larger than the address space");
        };
        let verdict = self.checker.try_check(linear, len)?;
        if !verdict.needs_bounce {
            self.checker.record(|s| s.direct_mappings += 1);
            return Ok(DmaMapping::Direct { verdict, direction });
        }

        match self.build_scatter_gather(data, linear, direction, self.max_segments) {
            Ok(list) => {
                return Ok(match list.into_single_bounce() {
                    Ok(handle) => DmaMapping::Bounced(handle),
                    Err(list) => DmaMapping::Split(list),
                });
            }
            Err(DmaError::TranslationFailure) => return Err(DmaError::TranslationFailure),
            Err(err) => debug!("isadma: split of {:#X}+{} failed: {:?}", linear.as_u32(), len, err),
        }

        let Some(mut handle) = self.acquire_bounce_buffer(direction, len) else {
            warn!(
                "isadma: no way to map {:#X}+{} for {:?}",
                linear.as_u32(),
                len,
                direction
            );
            return dma_err!(ResourceExhausted, "no bounce buffer available");
        };
        if direction == DmaDirection::ToDevice
            && let Some(dst) = self.pools.data_mut(&mut handle)
        {
            dst.copy_from_slice(data);
        }
        Ok(DmaMapping::Bounced(handle))
    }

    /// Release everything a mapping holds. Data the device wrote into a
    /// bounce buffer is discarded; use [`IsaDma::unmap_into`] to keep it.
    pub fn unmap(&self, mapping: DmaMapping) -> DmaResult {
        match mapping {
            DmaMapping::Direct { mut verdict, .. } => {
                self.checker.release(&mut verdict);
                Ok(())
            }
            DmaMapping::Split(list) => self.release_scatter_gather(list),
            DmaMapping::Bounced(handle) => {
                let direction = handle.direction();
                self.pools.release(direction, handle)
            }
        }
    }

    /// Copy what the device wrote back into `dest`, then release the
    /// mapping. Direct mappings need no copy.
    pub fn unmap_into(&self, mapping: DmaMapping, dest: &mut [u8]) -> DmaResult {
        let copied = match &mapping {
            DmaMapping::Direct { .. } => Ok(()),
            DmaMapping::Split(list) => list.scatter_back(&self.pools, dest),
            DmaMapping::Bounced(handle) => match self.pools.data(handle) {
                Some(src) if src.len() <= dest.len() => {
                    dest[..src.len()].copy_from_slice(src);
                    Ok(())
                }
                _ => dma_err!(InvalidParameter, "destination smaller than the bounce data"),
            },
        };
        let released = self.unmap(mapping);
        copied.and(released)
    }

    /// Guard-word sweep over both pools; returns the damaged buffer count.
    pub fn check_integrity(&self) -> usize {
        self.pools.check_integrity()
    }

    pub fn stats(&self) -> IsaDmaStats {
        IsaDmaStats {
            boundary: self.checker.stats(),
            tx_pool: self.pools.tx.stats(),
            rx_pool: self.pools.rx.stats(),
        }
    }

    /// Tear the context down, reporting buffers still checked out.
    pub fn shutdown(mut self) -> DmaResult {
        let outstanding = self.pools.tx.stats().allocated + self.pools.rx.stats().allocated;
        self.pools.tx.release_pins(&self.checker);
        self.pools.rx.release_pins(&self.checker);
        if outstanding != 0 {
            warn!("isadma: shutdown with {} bounce buffers outstanding", outstanding);
            return dma_err!(InvalidState, "bounce buffers still in use");
        }
        info!("isadma: context shut down");
        Ok(())
    }

    fn record_bounce(&self, direction: DmaDirection) {
        self.checker.record(|s| match direction {
            DmaDirection::ToDevice => s.bounce_tx_used += 1,
            DmaDirection::FromDevice => s.bounce_rx_used += 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn context() -> IsaDma {
        IsaDma::hosted(IsaDmaConfig::default(), 0x40000).unwrap()
    }

    #[test]
    fn frame_across_64k_edge_maps_as_split() {
        let dma = context();
        let verdict = dma.check_buffer_safety(LinearAddr::new(0x0FFF0), 1500);
        assert!(verdict.crosses_64k && verdict.needs_bounce);

        let frame = vec![0x11u8; 1500];
        let mapping = dma
            .map(LinearAddr::new(0x0FFF0), &frame, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(
            mapping.fragments(),
            vec![(PhysAddr::new(0x0FFF0), 16), (PhysAddr::new(0x10000), 1484)]
        );
        assert!(!mapping.is_copied());
        dma.unmap(mapping).unwrap();
        assert_eq!(dma.stats().boundary.splits_performed, 1);
    }

    #[test]
    fn conventional_frame_maps_direct() {
        let dma = context();
        let verdict = dma.check_buffer_safety(LinearAddr::new(0x20000), 1500);
        assert!(!verdict.needs_bounce);
        let frame = vec![0u8; 1500];
        let mapping = dma
            .map(LinearAddr::new(0x20000), &frame, DmaDirection::ToDevice)
            .unwrap();
        assert!(matches!(mapping, DmaMapping::Direct { .. }));
        dma.unmap(mapping).unwrap();
        assert_eq!(dma.stats().boundary.direct_mappings, 1);
    }

    #[test]
    fn misaligned_frame_falls_back_to_one_bounce() {
        let dma = context();
        let frame: Vec<u8> = (0..1500).map(|i| i as u8).collect();
        let mapping = dma
            .map(LinearAddr::new(0x20001), &frame, DmaDirection::ToDevice)
            .unwrap();
        let DmaMapping::Bounced(handle) = &mapping else {
            panic!("expected a bounce, got {mapping:?}");
        };
        assert_eq!(dma.bounce_data(handle).unwrap(), &frame[..]);
        assert_eq!(dma.stats().tx_pool.allocated, 1);
        dma.unmap(mapping).unwrap();
        let stats = dma.stats();
        assert_eq!(stats.tx_pool.allocated, 0);
        assert_eq!(stats.boundary.bounce_tx_used, 1);
    }

    #[test]
    fn received_bounce_is_copied_back() {
        let dma = context();
        let mut dest = vec![0u8; 100];
        let mut mapping = dma
            .map(LinearAddr::new(0x20003), &dest, DmaDirection::FromDevice)
            .unwrap();
        if let DmaMapping::Bounced(handle) = &mut mapping {
            dma.bounce_data_mut(handle).unwrap().fill(0xEE);
        }
        dma.unmap_into(mapping, &mut dest).unwrap();
        assert!(dest.iter().all(|b| *b == 0xEE));
        assert_eq!(dma.stats().rx_pool.allocated, 0);
    }

    #[test]
    fn exhausted_pools_report_resource_exhausted() {
        let dma = context();
        let frame = vec![0u8; 64];
        let held: Vec<_> = (0..8)
            .map(|_| dma.acquire_bounce_buffer(DmaDirection::ToDevice, 64).unwrap())
            .collect();
        assert_eq!(
            dma.map(LinearAddr::new(0x20001), &frame, DmaDirection::ToDevice)
                .unwrap_err(),
            DmaError::ResourceExhausted
        );
        for h in held {
            dma.release_bounce_buffer(DmaDirection::ToDevice, h).unwrap();
        }
        dma.shutdown().unwrap();
    }

    #[test]
    fn terminal_failures_are_not_bounced() {
        let dma = context();
        assert_eq!(
            dma.map(LinearAddr::new(0xB8000), &[0u8; 64], DmaDirection::ToDevice)
                .unwrap_err(),
            DmaError::TranslationFailure
        );
        assert_eq!(
            dma.map(LinearAddr::new(0x20000), &[], DmaDirection::ToDevice)
                .unwrap_err(),
            DmaError::InvalidParameter
        );
        assert_eq!(dma.stats().tx_pool.total_acquires, 0);
    }

    #[test]
    fn shutdown_reports_outstanding_buffers() {
        let dma = context();
        let _held = dma.acquire_bounce_buffer(DmaDirection::FromDevice, 64).unwrap();
        assert_eq!(dma.shutdown(), Err(DmaError::InvalidState));
    }

    #[test]
    fn bad_fragment_limit_is_rejected() {
        let config = IsaDmaConfig {
            max_segments: 0,
            ..IsaDmaConfig::default()
        };
        assert!(matches!(
            IsaDma::hosted(config, 0x40000),
            Err(DmaError::InvalidParameter)
        ));
    }
}
