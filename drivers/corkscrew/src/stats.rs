// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

/// Counters of both rings and their pools.
///
/// Each direction keeps its own copy under its own lock; [`RingStats::merge`]
/// folds them into the snapshot handed to callers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RingStats {
    pub total_allocations: u32,
    pub total_deallocations: u32,
    pub allocation_failures: u32,
    /// Frees of a buffer the pool did not consider allocated.
    pub deallocation_failures: u32,
    pub tx_packets: u32,
    pub tx_bytes: u32,
    pub tx_errors: u32,
    pub rx_packets: u32,
    pub rx_bytes: u32,
    pub rx_errors: u32,
    pub buffers_recycled: u32,
    /// Running total of leak findings.
    pub buffer_leaks_detected: u32,
    pub pool_exhausted: u32,
    pub peak_tx_usage: u32,
    pub peak_rx_usage: u32,
    pub ring_full_events: u32,
    pub ring_empty_events: u32,
    pub refill_failures: u32,
    pub current_allocated: u32,
    pub max_allocated: u32,
    /// Leaks found by the most recent validation.
    pub leaked_buffers: u32,
    /// Ring buffers whose guard words were found overwritten.
    pub guard_violations: u32,
    pub pool_expansions: u32,
    pub pool_shrinks: u32,
}

impl RingStats {
    /// Sum of two per-direction snapshots.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            total_allocations: self.total_allocations + other.total_allocations,
            total_deallocations: self.total_deallocations + other.total_deallocations,
            allocation_failures: self.allocation_failures + other.allocation_failures,
            deallocation_failures: self.deallocation_failures + other.deallocation_failures,
            tx_packets: self.tx_packets + other.tx_packets,
            tx_bytes: self.tx_bytes.wrapping_add(other.tx_bytes),
            tx_errors: self.tx_errors + other.tx_errors,
            rx_packets: self.rx_packets + other.rx_packets,
            rx_bytes: self.rx_bytes.wrapping_add(other.rx_bytes),
            rx_errors: self.rx_errors + other.rx_errors,
            buffers_recycled: self.buffers_recycled + other.buffers_recycled,
            buffer_leaks_detected: self.buffer_leaks_detected + other.buffer_leaks_detected,
            pool_exhausted: self.pool_exhausted + other.pool_exhausted,
            peak_tx_usage: self.peak_tx_usage.max(other.peak_tx_usage),
            peak_rx_usage: self.peak_rx_usage.max(other.peak_rx_usage),
            ring_full_events: self.ring_full_events + other.ring_full_events,
            ring_empty_events: self.ring_empty_events + other.ring_empty_events,
            refill_failures: self.refill_failures + other.refill_failures,
            current_allocated: self.current_allocated + other.current_allocated,
            max_allocated: self.max_allocated + other.max_allocated,
            leaked_buffers: self.leaked_buffers + other.leaked_buffers,
            guard_violations: self.guard_violations + other.guard_violations,
            pool_expansions: self.pool_expansions + other.pool_expansions,
            pool_shrinks: self.pool_shrinks + other.pool_shrinks,
        }
    }
}
