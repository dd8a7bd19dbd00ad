// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Critical-section lock parameterized by what it masks.

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use crate::guard::{BaseGuard, IrqSave};

/// Owner flag for configurations with a second CPU.
///
/// Without the `smp` feature this is zero-sized: on a single CPU the
/// guard alone keeps the completion handler out.
struct LockWord {
    #[cfg(feature = "smp")]
    held: core::sync::atomic::AtomicBool,
}

#[cfg(feature = "smp")]
impl LockWord {
    const fn new() -> Self {
        Self {
            held: core::sync::atomic::AtomicBool::new(false),
        }
    }

    fn try_take(&self) -> bool {
        use core::sync::atomic::Ordering;
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn take(&self) {
        while !self.try_take() {
            while self.is_held() {
                core::hint::spin_loop();
            }
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(core::sync::atomic::Ordering::Relaxed)
    }

    fn give(&self) {
        self.held.store(false, core::sync::atomic::Ordering::Release);
    }
}

#[cfg(not(feature = "smp"))]
impl LockWord {
    const fn new() -> Self {
        Self {}
    }

    #[inline(always)]
    fn try_take(&self) -> bool {
        true
    }

    #[inline(always)]
    fn take(&self) {}

    #[inline(always)]
    fn is_held(&self) -> bool {
        false
    }

    #[inline(always)]
    fn give(&self) {}
}

/// State shared with the completion interrupt.
///
/// `G` decides what is masked while the state is borrowed; the default
/// masks local interrupts.
pub struct IrqLock<T: ?Sized, G: BaseGuard = IrqSave> {
    _guard: PhantomData<G>,
    word: LockWord,
    data: UnsafeCell<T>,
}

/// Borrow of an [`IrqLock`]; interrupts stay masked until it drops.
pub struct IrqLockGuard<'a, T: ?Sized, G: BaseGuard = IrqSave> {
    lock: &'a IrqLock<T, G>,
    saved: G::State,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send, G: BaseGuard> Sync for IrqLock<T, G> {}
unsafe impl<T: ?Sized + Send, G: BaseGuard> Send for IrqLock<T, G> {}

impl<T, G: BaseGuard> IrqLock<T, G> {
    /// Wrap `data`; usable in `static` initializers.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            _guard: PhantomData,
            word: LockWord::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock and return the protected state.
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, G: BaseGuard> IrqLock<T, G> {
    /// Mask, then take the lock word.
    #[inline(always)]
    pub fn lock(&self) -> IrqLockGuard<'_, T, G> {
        let saved = G::acquire();
        self.word.take();
        IrqLockGuard { lock: self, saved }
    }

    /// Like [`IrqLock::lock`], but gives up instead of spinning.
    #[inline(always)]
    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T, G>> {
        let saved = G::acquire();
        if self.word.try_take() {
            Some(IrqLockGuard { lock: self, saved })
        } else {
            G::release(saved);
            None
        }
    }

    /// Run `f` inside the critical section and return its result.
    ///
    /// This is the preferred entry point for state shared with the
    /// completion interrupt. The closure must only do pointer and counter
    /// arithmetic: no allocation, no logging, no waiting on hardware.
    #[inline(always)]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Whether another CPU holds the lock. Always false on one CPU.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.word.is_held()
    }

    /// Access without masking; `&mut self` already rules out the handler.
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default, G: BaseGuard> Default for IrqLock<T, G> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug, G: BaseGuard> fmt::Debug for IrqLock<T, G> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = f.debug_struct("IrqLock");
        match self.try_lock() {
            Some(guard) => out.field("data", &&*guard),
            None => out.field("data", &"<locked>"),
        };
        out.finish()
    }
}

impl<T: ?Sized, G: BaseGuard> Deref for IrqLockGuard<'_, T, G> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: the lock word and the mask make this the only borrow.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized, G: BaseGuard> DerefMut for IrqLockGuard<'_, T, G> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`, and `&mut self` makes it unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized, G: BaseGuard> Drop for IrqLockGuard<'_, T, G> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.word.give();
        G::release(self.saved);
    }
}
