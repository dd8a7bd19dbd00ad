// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! RAII guards that mask the completion interrupt for a critical section.

/// Platform hook for masking local interrupts.
///
/// Implemented once by the platform layer with `pushf; cli` / `popf`
/// semantics. Only consulted on bare-metal targets.
#[crate_interface::def_interface]
pub trait IrqMaskIf {
    /// Save the interrupt flag and disable local interrupts.
    fn local_irq_save_and_disable() -> usize;

    /// Restore the interrupt flag saved by [`IrqMaskIf::local_irq_save_and_disable`].
    fn local_irq_restore(flags: usize);
}

/// Base trait for all guard types.
pub trait BaseGuard {
    /// State saved when entering the critical section.
    type State: Clone + Copy;

    /// Enter the critical section, returning saved state.
    fn acquire() -> Self::State;

    /// Exit the critical section, restoring state.
    fn release(state: Self::State);
}

mod types;

pub use types::{IrqSave, NoOp};
