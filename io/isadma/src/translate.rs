// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Linear to bus-physical address translation.
//!
//! A paging memory manager (DPMI host, EMM386, QEMM) may remap any 4 KiB
//! page, so when one is present every page of a range is translated. With
//! no such layer only conventional memory is trusted to be identity mapped;
//! anything above it is refused rather than guessed.

use alloc::boxed::Box;

use dmaerrno::{DmaResult, dma_err, ensure};
use log::{debug, info};

use crate::addr::{CONVENTIONAL_LIMIT, LinearAddr, PAGE_SIZE_4K, PhysAddr, align_rem};

/// Services of a virtualizing memory layer.
///
/// The platform provides this when it detects a paging memory manager.
pub trait PageService: Send + Sync {
    /// Physical base of the 4 KiB page that holds `page`.
    fn translate_page(&self, page: LinearAddr) -> Option<PhysAddr>;

    /// Pin `[start, start + len)` so its mapping cannot change.
    fn lock_region(&self, start: LinearAddr, len: u32) -> bool;

    /// Undo a successful [`PageService::lock_region`].
    fn unlock_region(&self, start: LinearAddr, len: u32);
}

/// How addresses are turned into physical ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranslationMode {
    /// No paging layer: identity below [`CONVENTIONAL_LIMIT`], failure above.
    Identity,
    /// A paging layer is present and consulted for every page.
    Paged,
}

/// Result of translating every page of a range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageWalk {
    /// Physical address of the first byte.
    pub start: PhysAddr,
    pub first_page: PhysAddr,
    pub last_page: PhysAddr,
    pub page_count: u32,
    /// Every page follows its predecessor physically.
    pub contiguous: bool,
}

/// Token for a pinned range. Hand it back to [`AddressTranslator::unlock`].
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageLock {
    start: LinearAddr,
    len: u32,
    pinned: bool,
}

impl PageLock {
    /// Whether the paging layer actually pinned anything.
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Turns program addresses into bus-physical addresses.
pub struct AddressTranslator {
    service: Option<Box<dyn PageService>>,
}

impl AddressTranslator {
    /// Translator for a machine without a paging memory manager.
    pub const fn identity() -> Self {
        Self { service: None }
    }

    /// Translator that uses `service` when a paging layer was detected.
    pub fn new(service: Option<Box<dyn PageService>>) -> Self {
        let translator = Self { service };
        info!("isadma: address translation mode {:?}", translator.mode());
        translator
    }

    pub fn mode(&self) -> TranslationMode {
        match self.service {
            Some(_) => TranslationMode::Paged,
            None => TranslationMode::Identity,
        }
    }

    /// Translate a single address.
    pub fn translate(&self, addr: LinearAddr) -> DmaResult<PhysAddr> {
        match &self.service {
            None if addr.as_u32() < CONVENTIONAL_LIMIT => Ok(PhysAddr::new(addr.as_u32())),
            None => dma_err!(
                TranslationFailure,
                format_args!("no paging service for {:#X}", addr.as_u32())
            ),
            Some(svc) => {
                let page = svc.translate_page(addr.page_base());
                match page.and_then(|p| p.checked_add(align_rem(addr.as_u32(), PAGE_SIZE_4K))) {
                    Some(phys) => Ok(phys),
                    None => dma_err!(
                        TranslationFailure,
                        format_args!("page of {:#X} not mapped", addr.as_u32())
                    ),
                }
            }
        }
    }

    /// Translate every page touched by `[addr, addr + len)`.
    ///
    /// All pages are visited even in identity mode so an intermediate page
    /// above the identity limit is caught.
    pub fn walk(&self, addr: LinearAddr, len: u32) -> DmaResult<PageWalk> {
        ensure!(len != 0, dma_err!(InvalidParameter, "zero-length range"));
        let Some(last) = addr.checked_add(len - 1) else {
            return dma_err!(InvalidParameter, "linear range wraps");
        };

        let start = self.translate(addr)?;
        let first_linear = addr.page_base().as_u32();
        let last_linear = last.page_base().as_u32();
        let page_count = (last_linear - first_linear) / PAGE_SIZE_4K + 1;

        let first_page = start.page_base();
        let mut prev = first_page;
        let mut contiguous = true;
        for i in 1..page_count {
            let linear = LinearAddr::new(first_linear + i * PAGE_SIZE_4K);
            let page = self.translate(linear)?.page_base();
            if contiguous && prev.checked_add(PAGE_SIZE_4K) != Some(page) {
                debug!(
                    "isadma: physical discontinuity at linear {:#X}",
                    linear.as_u32()
                );
                contiguous = false;
            }
            prev = page;
        }

        Ok(PageWalk {
            start,
            first_page,
            last_page: prev,
            page_count,
            contiguous,
        })
    }

    /// Pin a range for the duration of a transfer.
    pub fn lock(&self, addr: LinearAddr, len: u32) -> DmaResult<PageLock> {
        ensure!(len != 0, dma_err!(InvalidParameter, "zero-length lock"));
        match &self.service {
            None => {
                // Conventional memory never moves; there is nothing to pin.
                let resident = addr
                    .checked_add(len)
                    .is_some_and(|end| end.as_u32() <= CONVENTIONAL_LIMIT);
                if resident {
                    Ok(PageLock {
                        start: addr,
                        len,
                        pinned: false,
                    })
                } else {
                    dma_err!(LockFailure, "no paging service to pin memory above 640K")
                }
            }
            Some(svc) => {
                if svc.lock_region(addr, len) {
                    debug!("isadma: pinned {:#X}+{}", addr.as_u32(), len);
                    Ok(PageLock {
                        start: addr,
                        len,
                        pinned: true,
                    })
                } else {
                    dma_err!(
                        LockFailure,
                        format_args!("paging service refused {:#X}+{}", addr.as_u32(), len)
                    )
                }
            }
        }
    }

    /// Release a pin taken by [`AddressTranslator::lock`].
    pub fn unlock(&self, lock: PageLock) {
        if let (true, Some(svc)) = (lock.pinned, &self.service) {
            svc.unlock_region(lock.start, lock.len);
        }
    }
}

impl Default for AddressTranslator {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::{boxed::Box, sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};

    use dmaerrno::DmaError;

    use super::*;

    /// Paging layer with an explicit page table and lock counters.
    pub(crate) struct MockPager {
        /// (linear page, physical page) pairs.
        pub map: Vec<(u32, u32)>,
        pub refuse_locks: bool,
        pub locks: Arc<AtomicUsize>,
        pub unlocks: Arc<AtomicUsize>,
    }

    impl MockPager {
        pub(crate) fn new(map: Vec<(u32, u32)>) -> Self {
            Self {
                map,
                refuse_locks: false,
                locks: Arc::new(AtomicUsize::new(0)),
                unlocks: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Identity mapping for `pages` pages starting at `base`.
        pub(crate) fn identity(base: u32, pages: u32) -> Self {
            Self::new(
                (0..pages)
                    .map(|i| (base + i * PAGE_SIZE_4K, base + i * PAGE_SIZE_4K))
                    .collect(),
            )
        }
    }

    impl PageService for MockPager {
        fn translate_page(&self, page: LinearAddr) -> Option<PhysAddr> {
            self.map
                .iter()
                .find(|(l, _)| *l == page.as_u32())
                .map(|(_, p)| PhysAddr::new(*p))
        }

        fn lock_region(&self, _start: LinearAddr, _len: u32) -> bool {
            self.locks.fetch_add(1, Ordering::SeqCst);
            !self.refuse_locks
        }

        fn unlock_region(&self, _start: LinearAddr, _len: u32) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn identity_mode_trusts_only_conventional_memory() {
        let t = AddressTranslator::identity();
        assert_eq!(t.mode(), TranslationMode::Identity);
        assert_eq!(t.translate(LinearAddr::new(0x20000)), Ok(PhysAddr::new(0x20000)));
        assert_eq!(
            t.translate(LinearAddr::new(0xA0000)),
            Err(DmaError::TranslationFailure)
        );
        // The tail page lies above 640K.
        assert_eq!(
            t.walk(LinearAddr::new(0x9F800), 0x1000),
            Err(DmaError::TranslationFailure)
        );
    }

    #[test]
    fn walk_visits_every_page() {
        // Endpoints are contiguous with each other, the middle page is not.
        let pager = MockPager::new(vec![
            (0x200000, 0x300000),
            (0x201000, 0x500000),
            (0x202000, 0x302000),
        ]);
        let t = AddressTranslator::new(Some(Box::new(pager)));
        let walk = t.walk(LinearAddr::new(0x200010), 0x2000).unwrap();
        assert_eq!(walk.page_count, 3);
        assert_eq!(walk.start, PhysAddr::new(0x300010));
        assert_eq!(walk.first_page, PhysAddr::new(0x300000));
        assert_eq!(walk.last_page, PhysAddr::new(0x302000));
        assert!(!walk.contiguous);
    }

    #[test]
    fn walk_fails_on_unmapped_intermediate_page() {
        let pager = MockPager::new(vec![(0x200000, 0x300000), (0x202000, 0x302000)]);
        let t = AddressTranslator::new(Some(Box::new(pager)));
        assert_eq!(
            t.walk(LinearAddr::new(0x200000), 0x2001),
            Err(DmaError::TranslationFailure)
        );
    }

    #[test]
    fn walk_rejects_bad_ranges() {
        let t = AddressTranslator::identity();
        assert_eq!(t.walk(LinearAddr::new(0x1000), 0), Err(DmaError::InvalidParameter));
        assert_eq!(
            t.walk(LinearAddr::new(0xFFFF_FF00), 0x200),
            Err(DmaError::InvalidParameter)
        );
    }

    #[test]
    fn identity_locks() {
        let t = AddressTranslator::identity();
        let lock = t.lock(LinearAddr::new(0x9F000), 0x1000).unwrap();
        assert!(!lock.is_pinned());
        t.unlock(lock);
        assert_eq!(
            t.lock(LinearAddr::new(0x9F000), 0x1001),
            Err(DmaError::LockFailure)
        );
    }

    #[test]
    fn paged_locks_go_through_the_service() {
        let pager = MockPager::identity(0x100000, 4);
        let (locks, unlocks) = (pager.locks.clone(), pager.unlocks.clone());
        let t = AddressTranslator::new(Some(Box::new(pager)));
        let lock = t.lock(LinearAddr::new(0x100000), 64).unwrap();
        assert!(lock.is_pinned());
        t.unlock(lock);
        assert_eq!(locks.load(Ordering::SeqCst), 1);
        assert_eq!(unlocks.load(Ordering::SeqCst), 1);

        let mut refusing = MockPager::identity(0x100000, 4);
        refusing.refuse_locks = true;
        let t = AddressTranslator::new(Some(Box::new(refusing)));
        assert_eq!(
            t.lock(LinearAddr::new(0x100000), 64),
            Err(DmaError::LockFailure)
        );
    }
}
