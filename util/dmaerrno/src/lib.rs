// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error codes shared by the DMA buffer, cache and descriptor-ring crates.
#![cfg_attr(not(test), no_std)]

use core::fmt;

use strum::EnumCount;

/// The kind of failure reported by a DMA operation.
///
/// Every public operation of the subsystem returns one of these instead of
/// aborting; the caller decides whether to back off, bounce or give up.
#[repr(i32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumCount)]
pub enum DmaErrorKind {
    /// Null, zero-length or out-of-range input. Never partially processed.
    InvalidParameter = 1,
    /// The address cannot be mapped to a bus-physical address.
    ///
    /// Terminal for the allocation: no bounce buffer can help because the
    /// source of the copy is itself unknown.
    TranslationFailure,
    /// Mapped, but the range breaks one or more controller constraints.
    SafetyViolation,
    /// A pool or ring has no free slot left.
    ResourceExhausted,
    /// A guard pattern or leak-detector mismatch was found.
    Corruption,
    /// A hardware-completion wait expired.
    HardwareTimeout,
    /// The page-lock service refused to pin the range.
    LockFailure,
    /// The operation is not allowed in the current lifecycle state.
    InvalidState,
}

impl DmaErrorKind {
    /// Returns the error description.
    pub fn as_str(&self) -> &'static str {
        use DmaErrorKind::*;
        match *self {
            InvalidParameter => "Invalid parameter",
            TranslationFailure => "Address translation failed",
            SafetyViolation => "DMA constraint violated",
            ResourceExhausted => "Resource exhausted",
            Corruption => "Corruption detected",
            HardwareTimeout => "Hardware timed out",
            LockFailure => "Page lock failed",
            InvalidState => "Invalid state",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether the caller can recover locally (bounce, split or back off).
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::SafetyViolation
                | Self::ResourceExhausted
                | Self::HardwareTimeout
                | Self::LockFailure
        )
    }

    /// Whether the failure must be handled by copying through a bounce buffer.
    pub const fn forces_bounce(self) -> bool {
        matches!(
            self,
            Self::SafetyViolation | Self::HardwareTimeout | Self::LockFailure
        )
    }
}

impl TryFrom<i32> for DmaErrorKind {
    type Error = i32;

    #[inline]
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if value > 0 && value <= DmaErrorKind::COUNT as i32 {
            Ok(unsafe { core::mem::transmute::<i32, DmaErrorKind>(value) })
        } else {
            Err(value)
        }
    }
}

impl fmt::Display for DmaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error type of the DMA subsystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DmaError(DmaErrorKind);

impl DmaError {
    const fn new(kind: DmaErrorKind) -> Self {
        DmaError(kind)
    }

    /// Returns the kind of this error.
    pub const fn kind(self) -> DmaErrorKind {
        self.0
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self.0.code()
    }
}

impl From<DmaErrorKind> for DmaError {
    fn from(kind: DmaErrorKind) -> Self {
        DmaError::new(kind)
    }
}

impl TryFrom<i32> for DmaError {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        DmaErrorKind::try_from(value).map(DmaError::new)
    }
}

impl fmt::Debug for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaErrorKind::{:?}", self.0)
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! dma_error_consts {
    ($($name:ident),*) => {
        #[allow(non_upper_case_globals)]
        impl DmaError {
            $(
                #[doc = concat!("A [`DmaError`] with kind [`DmaErrorKind::", stringify!($name), "`].")]
                pub const $name: Self = Self::new(DmaErrorKind::$name);
            )*
        }
    };
}

dma_error_consts!(
    InvalidParameter,
    TranslationFailure,
    SafetyViolation,
    ResourceExhausted,
    Corruption,
    HardwareTimeout,
    LockFailure,
    InvalidState
);

/// A specialized [`Result`] type with [`DmaError`] as the error type.
pub type DmaResult<T = ()> = Result<T, DmaError>;

/// Constructs a [`DmaError`] while printing a warning message.
///
/// # Examples
///
/// ```
/// # use dmaerrno::{dma_err_type, DmaError};
/// assert_eq!(dma_err_type!(LockFailure), DmaError::LockFailure);
/// assert_eq!(
///     dma_err_type!(InvalidParameter, "zero-length buffer"),
///     DmaError::InvalidParameter,
/// );
/// ```
#[macro_export]
macro_rules! dma_err_type {
    ($err:ident) => {{
        use $crate::DmaErrorKind::*;
        let err = $crate::DmaError::from($err);
        $crate::__priv::warn!("[{:?}]", err);
        err
    }};
    ($err:ident, $msg:expr) => {{
        use $crate::DmaErrorKind::*;
        let err = $crate::DmaError::from($err);
        $crate::__priv::warn!("[{:?}] {}", err, $msg);
        err
    }};
}

/// Ensure a condition is true. If it is not, return from the function
/// with an error.
///
/// ```rust
/// # use dmaerrno::{ensure, dma_err, DmaResult};
/// fn example(len: usize) -> DmaResult {
///     ensure!(len > 0, dma_err!(InvalidParameter));
///     Ok(())
/// }
/// assert!(example(0).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($predicate:expr, $context_selector:expr $(,)?) => {
        if !$predicate {
            return $context_selector;
        }
    };
}

/// Constructs an [`Err(DmaError)`] while printing a warning message.
///
/// ```
/// # use dmaerrno::{dma_err, DmaResult, DmaError};
/// assert_eq!(
///     dma_err!(ResourceExhausted, "tx bounce pool empty"),
///     DmaResult::<()>::Err(DmaError::ResourceExhausted),
/// );
/// ```
/// [`Err(DmaError)`]: Err
#[macro_export]
macro_rules! dma_err {
    ($err:ident) => {
        Err($crate::dma_err_type!($err))
    };
    ($err:ident, $msg:expr) => {
        Err($crate::dma_err_type!($err, $msg))
    };
}

/// Returns early with an error of the given kind, optionally with a message.
#[macro_export]
macro_rules! dma_bail {
    ($($t:tt)*) => {
        return $crate::dma_err!($($t)*);
    };
}

#[doc(hidden)]
pub mod __priv {
    pub use log::warn;
}
