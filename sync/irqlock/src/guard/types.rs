// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use super::BaseGuard;

/// Guard that does nothing.
///
/// For code that already runs with interrupts masked, such as the
/// completion handler itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl BaseGuard for NoOp {
    type State = ();

    #[inline(always)]
    fn acquire() -> Self::State {}

    #[inline(always)]
    fn release(_state: Self::State) {}
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        /// Guard that saves the interrupt flag and masks local interrupts.
        #[derive(Debug)]
        pub struct IrqSave(usize);

        impl BaseGuard for IrqSave {
            type State = usize;

            #[inline]
            fn acquire() -> Self::State {
                crate_interface::call_interface!(crate::guard::IrqMaskIf::local_irq_save_and_disable)
            }

            #[inline]
            fn release(state: Self::State) {
                crate_interface::call_interface!(crate::guard::IrqMaskIf::local_irq_restore(state))
            }
        }

        impl IrqSave {
            /// Mask interrupts until the returned guard is dropped.
            #[inline]
            pub fn new() -> Self {
                Self(<Self as BaseGuard>::acquire())
            }
        }

        impl Drop for IrqSave {
            #[inline]
            fn drop(&mut self) {
                <Self as BaseGuard>::release(self.0)
            }
        }

        impl Default for IrqSave {
            #[inline]
            fn default() -> Self {
                Self::new()
            }
        }
    } else {
        // Hosted builds have no interrupt to mask.
        pub use NoOp as IrqSave;
    }
}
