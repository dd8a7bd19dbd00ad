// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use core::fmt;

use log::{debug, info};

use crate::ops::CacheOps;

/// Bytes the probe needs at minimum.
pub const PROBE_MIN_LEN: usize = 64;

const CPU_PATTERN: u8 = 0xAA;
const DEVICE_PATTERN: u8 = 0x55;

/// Cache maintenance strategy, chosen once at start-up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CacheTier {
    /// Flush individual lines (`clflush`).
    LineFlush,
    /// Write back and invalidate everything (`wbinvd`). Never per packet.
    GlobalFlush,
    /// Read and rewrite each line. Weakest guarantee.
    SoftwareTouch,
    /// The platform is coherent; nothing to do.
    NoOp,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LineFlush => "tier 1 (clflush)",
            Self::GlobalFlush => "tier 2 (wbinvd)",
            Self::SoftwareTouch => "tier 3 (software touch)",
            Self::NoOp => "tier 4 (coherent)",
        };
        f.write_str(name)
    }
}

/// Coherency as seen in each direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProbeResult {
    /// CPU writes are visible to the device without a flush.
    pub tx_coherent: bool,
    /// Device writes are visible to the CPU without an invalidate.
    pub rx_coherent: bool,
}

impl ProbeResult {
    pub const fn fully_coherent(&self) -> bool {
        self.tx_coherent && self.rx_coherent
    }
}

/// One-time coherency probe.
///
/// The receive direction is measured: the CPU fills `scratch`, reads it back
/// so it is cached, then a simulated device write stores a second pattern.
/// If the CPU now sees the second pattern the path is coherent.
///
/// The transmit direction cannot be measured without programming the
/// adapter, so it is reported as `assume_tx_coherent`.
pub fn probe<O: CacheOps>(ops: &O, scratch: &mut [u8], assume_tx_coherent: bool) -> ProbeResult {
    scratch.fill(CPU_PATTERN);
    let warm = scratch.iter().fold(0u8, |acc, b| acc ^ *b);
    debug!("cachesync: probe warmed {} bytes ({:#04x})", scratch.len(), warm);

    ops.simulate_device_write(scratch, DEVICE_PATTERN);
    let rx_coherent = scratch
        .iter()
        .all(|b| unsafe { core::ptr::read_volatile(b) } == DEVICE_PATTERN);

    let result = ProbeResult {
        tx_coherent: assume_tx_coherent,
        rx_coherent,
    };
    info!(
        "cachesync: coherency probe tx={} (assumed) rx={}",
        result.tx_coherent, result.rx_coherent
    );
    result
}

/// Pick the cheapest tier that is correct for this machine.
pub fn select_tier(probe: ProbeResult, has_clflush: bool, wbinvd_usable: bool) -> CacheTier {
    if probe.fully_coherent() {
        CacheTier::NoOp
    } else if has_clflush {
        CacheTier::LineFlush
    } else if wbinvd_usable {
        CacheTier::GlobalFlush
    } else {
        CacheTier::SoftwareTouch
    }
}
