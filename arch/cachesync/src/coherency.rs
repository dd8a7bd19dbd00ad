// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use dmaerrno::{DmaResult, dma_err, ensure};
use irqlock::IrqLock;
use log::{debug, info, warn};

use crate::{
    CoherencyConfig, MonotonicClock,
    coalesce::{CoalescingConfig, Pending},
    ops::{CacheOps, resolve_line_size},
    tier::{self, CacheTier, PROBE_MIN_LEN, ProbeResult, select_tier},
};

/// Counters of the coherency manager.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub tx_syncs: u32,
    pub rx_syncs: u32,
    pub clflush_calls: u32,
    pub wbinvd_calls: u32,
    pub software_flushes: u32,
    /// Requests parked in the coalescing window.
    pub deferred_flushes: u32,
    /// Global flushes triggered by the window filling up or timing out.
    pub coalesced_flushes: u32,
    /// Global flushes that had to happen immediately.
    pub forced_flushes: u32,
    /// Global flushes avoided by batching.
    pub performance_saves: u32,
    pub alignment_rejections: u32,
}

struct SyncState {
    pending: Pending,
    coalescing: CoalescingConfig,
    stats: CacheStats,
}

/// Why a global flush is about to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlushReason {
    Forced,
    Coalesced,
}

/// Per-adapter cache coherency context.
pub struct CacheCoherency<O: CacheOps, C: MonotonicClock> {
    ops: O,
    clock: C,
    probe: ProbeResult,
    tier: CacheTier,
    line_size: usize,
    wbinvd_enabled: bool,
    state: IrqLock<SyncState>,
}

impl<O: CacheOps, C: MonotonicClock> CacheCoherency<O, C> {
    /// Probe the machine using `scratch` and choose a tier.
    pub fn init(ops: O, clock: C, config: CoherencyConfig, scratch: &mut [u8]) -> DmaResult<Self> {
        ensure!(
            scratch.len() >= PROBE_MIN_LEN,
            dma_err!(InvalidParameter, "coherency probe scratch too small")
        );
        let line_size = resolve_line_size(ops.reported_line_size());
        let probe = tier::probe(&ops, scratch, config.assume_tx_coherent);
        let tier = select_tier(
            probe,
            ops.has_clflush(),
            ops.has_wbinvd() && config.wbinvd_enabled,
        );
        info!("cachesync: using {}, {}-byte lines", tier, line_size);
        Ok(Self {
            ops,
            clock,
            probe,
            tier,
            line_size,
            wbinvd_enabled: config.wbinvd_enabled,
            state: IrqLock::new(SyncState {
                pending: Pending::default(),
                coalescing: CoalescingConfig {
                    enabled: config.coalescing.enabled,
                    ..CoalescingConfig::new(config.coalescing.threshold, config.coalescing.delay_ms)
                },
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn probe_result(&self) -> ProbeResult {
        self.probe
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn stats(&self) -> CacheStats {
        self.state.with(|s| s.stats)
    }

    /// Requests currently waiting in the coalescing window.
    pub fn pending(&self) -> u32 {
        self.state.with(|s| s.pending.count)
    }

    /// Whether `[addr, addr + len)` covers whole cache lines only.
    pub fn is_line_aligned(&self, addr: usize, len: usize) -> bool {
        len != 0 && addr % self.line_size == 0 && len % self.line_size == 0
    }

    /// Whether `buf` has to be copied into a line-aligned pool buffer
    /// before it can be synced on this machine.
    pub fn needs_bounce_for_alignment(&self, buf: &[u8]) -> bool {
        self.tier == CacheTier::SoftwareTouch
            && !self.probe.fully_coherent()
            && !self.is_line_aligned(buf.as_ptr() as usize, buf.len())
    }

    /// Make CPU writes to `buf` visible to the adapter.
    ///
    /// On the global-flush tier this always flushes, absorbing anything
    /// waiting in the coalescing window.
    pub fn sync_for_device(&self, buf: &mut [u8]) -> DmaResult {
        ensure!(!buf.is_empty(), dma_err!(InvalidParameter, "empty sync"));
        self.state.with(|s| s.stats.tx_syncs += 1);
        if self.probe.tx_coherent {
            return Ok(());
        }
        self.maintain(buf)
    }

    /// Make adapter writes to `buf` visible to the CPU.
    pub fn sync_for_cpu(&self, buf: &mut [u8]) -> DmaResult {
        ensure!(!buf.is_empty(), dma_err!(InvalidParameter, "empty sync"));
        self.state.with(|s| s.stats.rx_syncs += 1);
        if self.probe.rx_coherent {
            return Ok(());
        }
        self.maintain(buf)
    }

    /// Like [`CacheCoherency::sync_for_device`], but on the global-flush
    /// tier the flush may be batched with others.
    ///
    /// The caller must invoke [`CacheCoherency::flush_before_start`] before
    /// telling the adapter to fetch the buffer.
    pub fn defer_sync_for_device(&self, buf: &mut [u8]) -> DmaResult {
        ensure!(!buf.is_empty(), dma_err!(InvalidParameter, "empty sync"));
        let batching = self.tier == CacheTier::GlobalFlush
            && !self.probe.tx_coherent
            && self.state.with(|s| s.coalescing.enabled);
        if !batching {
            return self.sync_for_device(buf);
        }

        let now = self.clock.now_ms();
        let due = self.state.with(|s| {
            s.stats.tx_syncs += 1;
            s.stats.deferred_flushes += 1;
            s.pending.push(now, &s.coalescing)
        });
        if due {
            self.global_flush(FlushReason::Coalesced);
        }
        Ok(())
    }

    /// Flush whatever is waiting in the coalescing window. Returns whether a
    /// flush ran.
    pub fn flush_before_start(&self) -> bool {
        self.global_flush(FlushReason::Forced)
    }

    /// Flush the window if its oldest request has waited long enough.
    pub fn poll(&self) -> bool {
        let now = self.clock.now_ms();
        let expired = self.state.with(|s| s.pending.expired(now, &s.coalescing));
        expired && self.global_flush(FlushReason::Coalesced)
    }

    /// Change the coalescing window. Out-of-range values are clamped.
    pub fn set_coalescing(&self, threshold: u32, delay_ms: u32) {
        let window = CoalescingConfig::new(threshold, delay_ms);
        self.state.with(|s| {
            s.coalescing = CoalescingConfig {
                enabled: s.coalescing.enabled,
                ..window
            }
        });
        info!(
            "cachesync: coalescing window {} requests / {} ms",
            window.threshold, window.delay_ms
        );
    }

    /// Turn batching on or off. Turning it off flushes pending work.
    pub fn enable_coalescing(&self, enabled: bool) {
        self.state.with(|s| s.coalescing.enabled = enabled);
        if !enabled {
            self.flush_before_start();
        }
    }

    /// Allow or forbid the global-flush tier. Takes effect at the next
    /// [`CacheCoherency::reselect_tier`].
    pub fn enable_wbinvd(&mut self, enabled: bool) {
        self.wbinvd_enabled = enabled;
    }

    /// Re-run tier selection after an administrative change.
    pub fn reselect_tier(&mut self) -> CacheTier {
        let tier = select_tier(
            self.probe,
            self.ops.has_clflush(),
            self.ops.has_wbinvd() && self.wbinvd_enabled,
        );
        if tier != self.tier {
            if self.tier == CacheTier::GlobalFlush {
                self.flush_before_start();
            }
            info!("cachesync: switching from {} to {}", self.tier, tier);
            self.tier = tier;
        }
        tier
    }

    /// Final flush before the context goes away.
    pub fn shutdown(self) -> CacheStats {
        if self.flush_before_start() {
            debug!("cachesync: flushed pending work at shutdown");
        }
        let stats = self.stats();
        info!(
            "cachesync: shut down, {} tx / {} rx syncs, {} flushes saved",
            stats.tx_syncs, stats.rx_syncs, stats.performance_saves
        );
        stats
    }

    fn maintain(&self, buf: &mut [u8]) -> DmaResult {
        match self.tier {
            CacheTier::NoOp => Ok(()),
            CacheTier::LineFlush => {
                let lines = self.flush_lines(buf);
                self.state.with(|s| s.stats.clflush_calls += lines);
                Ok(())
            }
            CacheTier::GlobalFlush => {
                self.force_global_flush();
                Ok(())
            }
            CacheTier::SoftwareTouch => self.touch_lines(buf),
        }
    }

    /// `clflush` every line that overlaps `buf`, partial ends rounded out.
    fn flush_lines(&self, buf: &[u8]) -> u32 {
        let head = buf.as_ptr() as usize % self.line_size;
        let lines = (head + buf.len()).div_ceil(self.line_size);
        let first = buf.as_ptr().wrapping_sub(head);
        for i in 0..lines {
            self.ops.clflush(first.wrapping_add(i * self.line_size));
        }
        lines as u32
    }

    /// Read and rewrite each line. Refuses partial lines, which may be
    /// shared with unrelated data.
    fn touch_lines(&self, buf: &mut [u8]) -> DmaResult {
        if !self.is_line_aligned(buf.as_ptr() as usize, buf.len()) {
            self.state.with(|s| s.stats.alignment_rejections += 1);
            warn!(
                "cachesync: {:p}+{} is not line aligned",
                buf.as_ptr(),
                buf.len()
            );
            return dma_err!(SafetyViolation, "partial cache line");
        }
        for line in buf.chunks_exact_mut(self.line_size) {
            let p = line.as_mut_ptr();
            unsafe { p.write_volatile(p.read_volatile()) };
        }
        self.state.with(|s| s.stats.software_flushes += 1);
        Ok(())
    }

    /// Immediate `wbinvd` that also serves everything pending.
    fn force_global_flush(&self) {
        self.state.with(|s| {
            let absorbed = s.pending.take();
            s.stats.forced_flushes += 1;
            s.stats.wbinvd_calls += 1;
            s.stats.performance_saves += absorbed;
        });
        self.ops.wbinvd();
    }

    /// `wbinvd` for the pending window, if it holds anything.
    fn global_flush(&self, reason: FlushReason) -> bool {
        let served = self.state.with(|s| {
            let served = s.pending.take();
            if served != 0 {
                s.stats.wbinvd_calls += 1;
                s.stats.performance_saves += served - 1;
                match reason {
                    FlushReason::Forced => s.stats.forced_flushes += 1,
                    FlushReason::Coalesced => s.stats.coalesced_flushes += 1,
                }
            }
            served
        });
        if served == 0 {
            return false;
        }
        self.ops.wbinvd();
        debug!("cachesync: {:?} wbinvd served {} requests", reason, served);
        true
    }
}
