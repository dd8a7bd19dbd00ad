// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Cache maintenance around bus-master DMA.
//!
//! A [`CacheCoherency`] context probes the machine once, settles on a
//! [`CacheTier`] and from then on keeps CPU caches and device-visible
//! memory in agreement, separately for each direction:
//!
//! - [`CacheCoherency::sync_for_device`] before the adapter reads a buffer
//!   the CPU wrote;
//! - [`CacheCoherency::sync_for_cpu`] before the CPU reads a buffer the
//!   adapter wrote.
//!
//! Global flushes are expensive and are batched through
//! [`CacheCoherency::defer_sync_for_device`]; anything batched is flushed
//! by [`CacheCoherency::flush_before_start`] before the adapter is kicked.
#![cfg_attr(not(test), no_std)]

mod coalesce;
mod coherency;
mod ops;
mod tier;

pub use coalesce::{
    CoalescingConfig, DEFAULT_DELAY_MS, DEFAULT_THRESHOLD, MAX_DELAY_MS, MAX_THRESHOLD,
};
pub use coherency::{CacheCoherency, CacheStats};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use ops::X86CacheOps;
pub use ops::{CacheOps, DEFAULT_LINE_SIZE, resolve_line_size};
pub use tier::{CacheTier, PROBE_MIN_LEN, ProbeResult, select_tier};

/// Monotonic millisecond counter. No wall-clock meaning.
pub trait MonotonicClock {
    fn now_ms(&self) -> u64;
}

/// Start-up settings of a [`CacheCoherency`] context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoherencyConfig {
    /// Treat CPU-to-device writes as coherent. The probe cannot measure
    /// this direction, so it is off unless the platform is known.
    pub assume_tx_coherent: bool,
    /// Allow the global-flush tier. Off by default: `wbinvd` stalls the
    /// whole machine.
    pub wbinvd_enabled: bool,
    pub coalescing: CoalescingConfig,
}

impl Default for CoherencyConfig {
    fn default() -> Self {
        Self {
            assume_tx_coherent: false,
            wbinvd_enabled: false,
            coalescing: CoalescingConfig::default(),
        }
    }
}
