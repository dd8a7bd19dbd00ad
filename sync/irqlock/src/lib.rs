// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! Interrupt-masking locks for state shared between mainline driver code
//! and the transfer-completion interrupt.
//!
//! The target has a single hardware thread, so masking the interrupt is the
//! whole synchronization story. [`IrqLock::with`] scopes the masked region
//! to one closure, which keeps every critical section visibly short:
//!
//! ```rust
//! use irqlock::IrqLock;
//!
//! struct Ring { cur: u32, dirty: u32 }
//!
//! let ring: IrqLock<Ring> = IrqLock::new(Ring { cur: 0, dirty: 0 });
//! let in_flight = ring.with(|r| {
//!     r.cur = r.cur.wrapping_add(1);
//!     r.cur.wrapping_sub(r.dirty)
//! });
//! assert_eq!(in_flight, 1);
//! ```
//!
//! On bare-metal targets the platform implements [`IrqMaskIf`]; hosted builds
//! mask nothing so the subsystem can be unit tested.

mod guard;
mod lock;

pub use guard::{BaseGuard, IrqMaskIf, IrqSave, NoOp};
pub use lock::{IrqLock, IrqLockGuard};

/// Lock that masks nothing. Only for contexts that already run with
/// interrupts masked, such as the completion handler.
pub type RawLock<T> = IrqLock<T, NoOp>;
