// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Classifies a buffer's physical range against bus-master constraints.

use dmaerrno::{DmaError, DmaResult, dma_err};
use irqlock::IrqLock;
use log::{debug, warn};

use crate::{
    addr::{
        ISA_ADDRESS_LIMIT, LinearAddr, PhysAddr, RegionClass, checked_end, crosses_64k,
        is_bus_visible,
    },
    translate::{AddressTranslator, PageLock},
};

/// Addressing limits of one device class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaConstraints {
    /// Highest byte address the device can reach.
    pub max_address: u32,
    /// Required start alignment in bytes.
    pub alignment: u32,
    pub forbid_64k_crossing: bool,
    pub require_contiguous: bool,
    /// Largest single transfer in bytes.
    pub max_transfer: u32,
}

impl DmaConstraints {
    /// 3C515-TX ISA bus master.
    pub const CORKSCREW: Self = Self {
        max_address: ISA_ADDRESS_LIMIT - 1,
        alignment: 4,
        forbid_64k_crossing: true,
        require_contiguous: true,
        max_transfer: 0x1_0000,
    };

    /// Strictest ISA profile, bounded to one Ethernet frame per transfer.
    pub const ISA_FRAME: Self = Self {
        max_transfer: 1518,
        ..Self::CORKSCREW
    };
}

impl Default for DmaConstraints {
    fn default() -> Self {
        Self::CORKSCREW
    }
}

/// Outcome of a safety check on one range.
///
/// `needs_bounce == false` means the range can be handed to the device as is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SafetyVerdict {
    pub linear: LinearAddr,
    pub len: u32,
    /// Physical start; zero when untranslated.
    pub phys: PhysAddr,
    /// Physical address of the last byte.
    pub end: PhysAddr,
    pub page_count: u32,
    pub translated: bool,
    /// `phys + len - 1` overflowed 32 bits.
    pub address_wraps: bool,
    pub crosses_64k: bool,
    pub exceeds_16m: bool,
    pub exceeds_24bit_isa_limit: bool,
    pub misaligned: bool,
    pub is_contiguous: bool,
    pub too_long: bool,
    pub region_class: RegionClass,
    pub bus_visible: bool,
    /// Pin held on non-conventional memory; release with [`SafetyChecker::release`].
    pub lock: Option<PageLock>,
    pub needs_bounce: bool,
}

impl SafetyVerdict {
    /// Verdict for a range that could not be examined: every flag set.
    fn conservative(linear: LinearAddr, len: u32) -> Self {
        Self {
            linear,
            len,
            phys: PhysAddr::new(0),
            end: PhysAddr::new(0),
            page_count: 0,
            translated: false,
            address_wraps: true,
            crosses_64k: true,
            exceeds_16m: true,
            exceeds_24bit_isa_limit: true,
            misaligned: true,
            is_contiguous: false,
            too_long: true,
            region_class: RegionClass::Extended,
            bus_visible: false,
            lock: None,
            needs_bounce: true,
        }
    }

    /// Whether the device may use the range directly.
    pub const fn is_direct_safe(&self) -> bool {
        !self.needs_bounce
    }
}

/// Counters kept by the checker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BoundaryStats {
    pub total_checks: u32,
    pub boundary_64k_violations: u32,
    pub boundary_16m_violations: u32,
    pub isa_24bit_violations: u32,
    pub alignment_violations: u32,
    pub contiguity_violations: u32,
    pub translation_failures: u32,
    pub lock_failures: u32,
    pub conventional_hits: u32,
    pub umb_rejections: u32,
    pub xms_rejections: u32,
    pub bounce_tx_used: u32,
    pub bounce_rx_used: u32,
    pub splits_performed: u32,
    pub direct_mappings: u32,
}

/// Decides whether a buffer can be handed to the bus master directly.
pub struct SafetyChecker {
    translator: AddressTranslator,
    constraints: DmaConstraints,
    stats: IrqLock<BoundaryStats>,
}

impl SafetyChecker {
    pub fn new(translator: AddressTranslator, constraints: DmaConstraints) -> Self {
        Self {
            translator,
            constraints,
            stats: IrqLock::new(BoundaryStats::default()),
        }
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub fn constraints(&self) -> &DmaConstraints {
        &self.constraints
    }

    /// Check `[addr, addr + len)`.
    ///
    /// Never fails: an untranslatable or empty range yields a verdict with
    /// every flag set. Use [`SafetyChecker::try_check`] to tell those apart.
    pub fn check(&self, addr: LinearAddr, len: u32) -> SafetyVerdict {
        let walk = match self.translator.walk(addr, len) {
            Ok(walk) => walk,
            Err(_) => {
                self.stats.with(|s| {
                    s.total_checks += 1;
                    s.translation_failures += 1;
                });
                return SafetyVerdict::conservative(addr, len);
            }
        };

        let c = &self.constraints;
        let phys = walk.start.as_u32();
        let (end, address_wraps) = match checked_end(phys, len) {
            Some(end) => (end, false),
            None => (phys.wrapping_add(len.wrapping_sub(1)), true),
        };

        // Every check runs so the counters stay truthful.
        let crosses = crosses_64k(phys, len);
        let exceeds_16m = address_wraps || end >= ISA_ADDRESS_LIMIT;
        let exceeds_24bit = address_wraps || phys > c.max_address || end > c.max_address;
        let misaligned = !walk.start.is_aligned(c.alignment);
        let is_contiguous = walk.contiguous;
        let too_long = len > c.max_transfer;
        let region_class = RegionClass::of(phys).max(RegionClass::of(end));
        let bus_visible = !address_wraps && is_bus_visible(phys, end);

        let mut needs_bounce = address_wraps
            || (crosses && c.forbid_64k_crossing)
            || exceeds_16m
            || exceeds_24bit
            || misaligned
            || (!is_contiguous && c.require_contiguous)
            || too_long
            || !bus_visible;

        // Only conventional memory is resident without proof.
        let mut lock = None;
        let mut lock_failed = false;
        if !needs_bounce && region_class != RegionClass::Conventional {
            match self.translator.lock(addr, len) {
                Ok(l) => lock = Some(l),
                Err(_) => {
                    lock_failed = true;
                    needs_bounce = true;
                }
            }
        }

        self.stats.with(|s| {
            s.total_checks += 1;
            s.boundary_64k_violations += crosses as u32;
            s.boundary_16m_violations += exceeds_16m as u32;
            s.isa_24bit_violations += exceeds_24bit as u32;
            s.alignment_violations += misaligned as u32;
            s.contiguity_violations += !is_contiguous as u32;
            s.lock_failures += lock_failed as u32;
            match region_class {
                RegionClass::Conventional => s.conventional_hits += 1,
                RegionClass::UpperMemory => s.umb_rejections += 1,
                RegionClass::Extended => s.xms_rejections += 1,
            }
        });

        if needs_bounce {
            debug!(
                "isadma: {:#X}+{} needs bounce (64k={} 16m={} 24bit={} align={} contig={} long={} visible={} lock_failed={})",
                phys,
                len,
                crosses,
                exceeds_16m,
                exceeds_24bit,
                misaligned,
                is_contiguous,
                too_long,
                bus_visible,
                lock_failed
            );
        }
        if exceeds_24bit {
            warn!(
                "isadma: range {:#X}..={:#X} beyond the ISA 24-bit limit",
                phys, end
            );
        }

        SafetyVerdict {
            linear: addr,
            len,
            phys: walk.start,
            end: PhysAddr::new(end),
            page_count: walk.page_count,
            translated: true,
            address_wraps,
            crosses_64k: crosses,
            exceeds_16m,
            exceeds_24bit_isa_limit: exceeds_24bit,
            misaligned,
            is_contiguous,
            too_long,
            region_class,
            bus_visible,
            lock,
            needs_bounce,
        }
    }

    /// Like [`SafetyChecker::check`], but reports the terminal failures.
    ///
    /// `InvalidParameter` for an empty range and `TranslationFailure` when the
    /// address cannot be mapped. A range that merely needs a bounce is `Ok`.
    pub fn try_check(&self, addr: LinearAddr, len: u32) -> DmaResult<SafetyVerdict> {
        if len == 0 {
            return dma_err!(InvalidParameter, "zero-length buffer");
        }
        let verdict = self.check(addr, len);
        if verdict.translated {
            Ok(verdict)
        } else {
            Err(DmaError::TranslationFailure)
        }
    }

    /// Drop the page pin held by a verdict, if any.
    pub fn release(&self, verdict: &mut SafetyVerdict) {
        if let Some(lock) = verdict.lock.take() {
            self.translator.unlock(lock);
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BoundaryStats {
        self.stats.with(|s| *s)
    }

    pub fn reset_stats(&self) {
        self.stats.with(|s| *s = BoundaryStats::default());
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut BoundaryStats)) {
        self.stats.with(f)
    }
}
