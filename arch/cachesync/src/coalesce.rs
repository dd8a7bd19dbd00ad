// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Batching of global flushes.
//!
//! Deferred requests are absorbed until either `threshold` of them are
//! pending or the oldest has waited `delay_ms`, then one `wbinvd` serves
//! them all.

pub const DEFAULT_THRESHOLD: u32 = 8;
pub const MAX_THRESHOLD: u32 = 32;
pub const DEFAULT_DELAY_MS: u32 = 50;
pub const MAX_DELAY_MS: u32 = 1000;

/// Coalescing window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoalescingConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub delay_ms: u32,
}

impl CoalescingConfig {
    /// Build a window, clamping both bounds into their legal ranges.
    pub fn new(threshold: u32, delay_ms: u32) -> Self {
        Self {
            enabled: true,
            threshold: threshold.clamp(1, MAX_THRESHOLD),
            delay_ms: delay_ms.clamp(1, MAX_DELAY_MS),
        }
    }
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_DELAY_MS)
    }
}

/// Requests waiting for a global flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Pending {
    pub count: u32,
    /// Clock value when the oldest pending request arrived.
    pub since_ms: Option<u64>,
}

impl Pending {
    /// Add one request. Returns `true` once the threshold is reached.
    pub fn push(&mut self, now_ms: u64, config: &CoalescingConfig) -> bool {
        self.count += 1;
        self.since_ms.get_or_insert(now_ms);
        self.count >= config.threshold
    }

    /// The oldest request has waited long enough.
    pub fn expired(&self, now_ms: u64, config: &CoalescingConfig) -> bool {
        self.since_ms
            .is_some_and(|since| now_ms.saturating_sub(since) >= config.delay_ms as u64)
    }

    /// Empty the window, returning how many requests it held.
    pub fn take(&mut self) -> u32 {
        let count = self.count;
        *self = Self::default();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_clamped() {
        assert_eq!(CoalescingConfig::new(0, 0).threshold, 1);
        assert_eq!(CoalescingConfig::new(0, 0).delay_ms, 1);
        assert_eq!(CoalescingConfig::new(100, 5000).threshold, MAX_THRESHOLD);
        assert_eq!(CoalescingConfig::new(100, 5000).delay_ms, MAX_DELAY_MS);
        let d = CoalescingConfig::default();
        assert_eq!((d.threshold, d.delay_ms, d.enabled), (8, 50, true));
    }

    #[test]
    fn window_closes_on_count_or_age() {
        let cfg = CoalescingConfig::new(3, 50);
        let mut p = Pending::default();
        assert!(!p.expired(1000, &cfg));
        assert!(!p.push(100, &cfg));
        assert!(!p.push(120, &cfg));
        assert!(!p.expired(149, &cfg));
        assert!(p.expired(150, &cfg));
        assert!(p.push(130, &cfg));
        assert_eq!(p.take(), 3);
        assert_eq!(p, Pending::default());
    }
}
