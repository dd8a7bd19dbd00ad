// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Splitting a buffer into fragments that each respect the DMA rules.
//!
//! Fragments end on physical 64 KiB edges. A fragment that is still unsafe
//! after the cut (misaligned head, memory above the ISA limit, a refused
//! pin) is carried by a bounce buffer instead; outgoing data is copied into
//! it when the list is built, incoming data is copied out by
//! [`ScatterGatherList::scatter_back`].

use alloc::vec::Vec;

use dmaerrno::{DmaError, DmaResult, dma_err, ensure};
use log::{debug, warn};

use crate::{
    DmaDirection,
    addr::{LinearAddr, PhysAddr, bytes_to_segment_end},
    bounce::{BounceHandle, BouncePools},
    safety::SafetyChecker,
    translate::PageLock,
};

/// Most fragments one transfer may be split into.
pub const MAX_SG_SEGMENTS: usize = 8;

/// One hardware fragment.
#[derive(Debug)]
pub struct Segment {
    pub phys: PhysAddr,
    /// Offset of the fragment within the original buffer.
    pub offset: u32,
    pub length: u32,
    bounce: Option<BounceHandle>,
    lock: Option<PageLock>,
}

impl Segment {
    pub fn is_bounced(&self) -> bool {
        self.bounce.is_some()
    }
}

/// A buffer described as a short list of DMA-safe fragments.
#[derive(Debug)]
pub struct ScatterGatherList {
    linear: LinearAddr,
    total_length: u32,
    direction: DmaDirection,
    segments: Vec<Segment>,
}

impl ScatterGatherList {
    /// Split `data`, located at `linear`, into at most `max_segments`
    /// fragments.
    ///
    /// `TranslationFailure` is terminal. Any other error means the split is
    /// not possible and the caller should fall back to a single bounce.
    /// Nothing stays acquired when this fails.
    pub fn build(
        checker: &SafetyChecker,
        pools: &BouncePools,
        data: &[u8],
        linear: LinearAddr,
        direction: DmaDirection,
        max_segments: usize,
    ) -> DmaResult<Self> {
        ensure!(
            !data.is_empty() && (1..=MAX_SG_SEGMENTS).contains(&max_segments),
            dma_err!(InvalidParameter, "bad scatter-gather request")
        );
        let Ok(total_length) = u32::try_from(data.len()) else {
            return dma_err!(InvalidParameter, "buffer larger than the address space");
        };
        ensure!(
            linear.checked_add(total_length - 1).is_some(),
            dma_err!(InvalidParameter, "linear range wraps")
        );

        let mut list = Self {
            linear,
            total_length,
            direction,
            segments: Vec::with_capacity(max_segments),
        };
        if let Err(err) = list.fill(checker, pools, data, max_segments) {
            list.release(checker, pools).ok();
            return Err(err);
        }

        if list.segments.len() > 1 {
            checker.record(|s| s.splits_performed += 1);
        }
        debug!(
            "isadma: {:#X}+{} split into {} fragments ({} bounced)",
            linear.as_u32(),
            total_length,
            list.segments.len(),
            list.bounced_count()
        );
        Ok(list)
    }

    fn fill(
        &mut self,
        checker: &SafetyChecker,
        pools: &BouncePools,
        data: &[u8],
        max_segments: usize,
    ) -> DmaResult {
        let mut offset = 0u32;
        while offset < self.total_length {
            if self.segments.len() == max_segments {
                return dma_err!(SafetyViolation, "fragment limit reached");
            }
            // The range was checked not to wrap.
            let seg_linear = LinearAddr::new(self.linear.as_u32() + offset);
            let phys = checker.translator().translate(seg_linear)?;
            let remaining = self.total_length - offset;
            let length = remaining.min(bytes_to_segment_end(phys.as_u32()));

            let mut verdict = checker.check(seg_linear, length);
            if !verdict.translated {
                return Err(DmaError::TranslationFailure);
            }
            let segment = if verdict.needs_bounce {
                checker.release(&mut verdict);
                let Some(mut handle) = pools.acquire(self.direction, length) else {
                    return dma_err!(ResourceExhausted, "no bounce buffer for fragment");
                };
                if self.direction == DmaDirection::ToDevice {
                    let src = &data[offset as usize..(offset + length) as usize];
                    if let Some(dst) = pools.data_mut(&mut handle) {
                        dst.copy_from_slice(src);
                    }
                }
                let direction = self.direction;
                checker.record(|s| match direction {
                    DmaDirection::ToDevice => s.bounce_tx_used += 1,
                    DmaDirection::FromDevice => s.bounce_rx_used += 1,
                });
                Segment {
                    phys: handle.phys(),
                    offset,
                    length,
                    bounce: Some(handle),
                    lock: None,
                }
            } else {
                Segment {
                    phys: verdict.phys,
                    offset,
                    length,
                    bounce: None,
                    lock: verdict.lock.take(),
                }
            };
            self.segments.push(segment);
            offset += length;
        }
        Ok(())
    }

    pub fn linear(&self) -> LinearAddr {
        self.linear
    }

    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn bounced_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_bounced()).count()
    }

    /// Copy the bytes the device will see into `out`.
    ///
    /// Direct fragments come from `original`, bounced ones from their
    /// buffer.
    pub fn gather(&self, pools: &BouncePools, original: &[u8], out: &mut [u8]) -> DmaResult {
        ensure!(
            original.len() == self.total_length as usize && out.len() >= original.len(),
            dma_err!(InvalidParameter, "gather buffer size mismatch")
        );
        for seg in &self.segments {
            let range = seg.offset as usize..(seg.offset + seg.length) as usize;
            let src = match &seg.bounce {
                Some(handle) => pools
                    .data(handle)
                    .ok_or(DmaError::InvalidState)?,
                None => &original[range.clone()],
            };
            out[range].copy_from_slice(src);
        }
        Ok(())
    }

    /// Copy device-written bytes of bounced fragments into `original`.
    pub fn scatter_back(&self, pools: &BouncePools, original: &mut [u8]) -> DmaResult {
        ensure!(
            original.len() == self.total_length as usize,
            dma_err!(InvalidParameter, "scatter buffer size mismatch")
        );
        for seg in &self.segments {
            if let Some(handle) = &seg.bounce {
                let src = pools.data(handle).ok_or(DmaError::InvalidState)?;
                original[seg.offset as usize..(seg.offset + seg.length) as usize]
                    .copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Return every bounce buffer and page pin. Reports the first failure
    /// after releasing everything.
    pub fn release(mut self, checker: &SafetyChecker, pools: &BouncePools) -> DmaResult {
        let mut result = Ok(());
        for seg in self.segments.drain(..) {
            if let Some(lock) = seg.lock {
                checker.translator().unlock(lock);
            }
            if let Some(handle) = seg.bounce
                && let Err(err) = pools.release(self.direction, handle)
            {
                warn!("isadma: fragment at offset {} not released: {:?}", seg.offset, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Unwrap a list that is one bounced fragment covering the whole
    /// buffer; any other list is handed back.
    pub fn into_single_bounce(mut self) -> Result<BounceHandle, Self> {
        let single = matches!(
            self.segments.as_slice(),
            [seg] if seg.length == self.total_length && seg.is_bounced()
        );
        if !single {
            return Err(self);
        }
        match self.segments.pop().and_then(|seg| seg.bounce) {
            Some(handle) => Ok(handle),
            None => Err(self),
        }
    }

    #[cfg(test)]
    pub(crate) fn bounce_of_mut(&mut self, index: usize) -> Option<&mut BounceHandle> {
        self.segments.get_mut(index)?.bounce.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec, vec::Vec};

    use super::*;
    use crate::{
        bounce::{BouncePool, BouncePoolConfig},
        region::DmaRegion,
        safety::DmaConstraints,
        translate::{AddressTranslator, tests::MockPager},
    };

    fn pools(checker: &SafetyChecker) -> BouncePools {
        let mk = |dir, cfg: BouncePoolConfig, base| {
            let region = DmaRegion::new(cfg.region_len(), LinearAddr::new(base));
            BouncePool::new(dir, cfg, region, checker).unwrap()
        };
        BouncePools {
            tx: mk(DmaDirection::ToDevice, BouncePoolConfig::TX_DEFAULT, 0x40000),
            rx: mk(DmaDirection::FromDevice, BouncePoolConfig::RX_DEFAULT, 0x60000),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn split_at_64k_edge_needs_no_copy() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        let data = pattern(1500);
        let list = ScatterGatherList::build(
            &checker,
            &pools,
            &data,
            LinearAddr::new(0x0FFF0),
            DmaDirection::ToDevice,
            MAX_SG_SEGMENTS,
        )
        .unwrap();

        let segs = list.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].phys, segs[0].length), (PhysAddr::new(0x0FFF0), 16));
        assert_eq!((segs[1].phys, segs[1].length), (PhysAddr::new(0x10000), 1484));
        assert_eq!(list.bounced_count(), 0);
        assert_eq!(checker.stats().splits_performed, 1);

        let mut out = vec![0u8; data.len()];
        list.gather(&pools, &data, &mut out).unwrap();
        assert_eq!(out, data);
        list.release(&checker, &pools).unwrap();
    }

    #[test]
    fn misaligned_head_is_bounced_and_gathers_back() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        let data = pattern(1500);
        let list = ScatterGatherList::build(
            &checker,
            &pools,
            &data,
            LinearAddr::new(0x0FFF1),
            DmaDirection::ToDevice,
            MAX_SG_SEGMENTS,
        )
        .unwrap();
        assert_eq!(list.segments().len(), 2);
        assert!(list.segments()[0].is_bounced());
        assert!(!list.segments()[1].is_bounced());
        assert_eq!(pools.tx.stats().allocated, 1);

        let mut out = vec![0u8; data.len()];
        list.gather(&pools, &data, &mut out).unwrap();
        assert_eq!(out, data);

        list.release(&checker, &pools).unwrap();
        assert_eq!(pools.tx.stats().allocated, 0);
    }

    #[test]
    fn receive_fragments_scatter_back() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        let mut dest = vec![0u8; 64];
        let mut list = ScatterGatherList::build(
            &checker,
            &pools,
            &dest,
            LinearAddr::new(0x2_0001),
            DmaDirection::FromDevice,
            2,
        )
        .unwrap();
        assert_eq!(list.bounced_count(), 1);

        let handle = list.bounce_of_mut(0).unwrap();
        pools.data_mut(handle).unwrap().fill(0x5A);
        list.scatter_back(&pools, &mut dest).unwrap();
        assert!(dest.iter().all(|b| *b == 0x5A));
        list.release(&checker, &pools).unwrap();
        assert_eq!(pools.rx.stats().allocated, 0);
    }

    #[test]
    fn too_many_fragments_leave_nothing_behind() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        let data = pattern(1500);
        // The bounced head is acquired before the limit is hit.
        let result = ScatterGatherList::build(
            &checker,
            &pools,
            &data,
            LinearAddr::new(0x0FFF1),
            DmaDirection::ToDevice,
            1,
        );
        assert_eq!(result.unwrap_err(), DmaError::SafetyViolation);
        let s = pools.tx.stats();
        assert_eq!((s.total_acquires, s.allocated), (1, 0));
    }

    #[test]
    fn scattered_pages_bounce_per_fragment() {
        // No two pages are physically adjacent.
        let map: Vec<(u32, u32)> = (0..2)
            .map(|i| (0x200000 + i * 0x1000, 0x300000 + i * 0x3000))
            .collect();
        let translator = AddressTranslator::new(Some(Box::new(MockPager::new(map))));
        let backing = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&backing);
        let checker = SafetyChecker::new(translator, DmaConstraints::CORKSCREW);

        // Straddles the page seam, so the fragment is discontiguous.
        let data = pattern(256);
        let list = ScatterGatherList::build(
            &checker,
            &pools,
            &data,
            LinearAddr::new(0x200F80),
            DmaDirection::ToDevice,
            MAX_SG_SEGMENTS,
        )
        .unwrap();
        assert_eq!(list.segments().len(), 1);
        assert!(list.segments()[0].is_bounced());
        let mut out = vec![0u8; data.len()];
        list.gather(&pools, &data, &mut out).unwrap();
        assert_eq!(out, data);
        list.release(&checker, &pools).unwrap();
    }

    #[test]
    fn untranslatable_fragment_is_terminal() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        let data = pattern(64);
        let result = ScatterGatherList::build(
            &checker,
            &pools,
            &data,
            LinearAddr::new(0xB0000),
            DmaDirection::ToDevice,
            MAX_SG_SEGMENTS,
        );
        assert_eq!(result.unwrap_err(), DmaError::TranslationFailure);
    }

    #[test]
    fn rejects_bad_limits() {
        let checker = SafetyChecker::new(AddressTranslator::identity(), DmaConstraints::CORKSCREW);
        let pools = pools(&checker);
        for max in [0, MAX_SG_SEGMENTS + 1] {
            let result = ScatterGatherList::build(
                &checker,
                &pools,
                &[1, 2, 3],
                LinearAddr::new(0x20000),
                DmaDirection::ToDevice,
                max,
            );
            assert_eq!(result.unwrap_err(), DmaError::InvalidParameter);
        }
    }
}
