// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! CPU cache primitives.

use cfg_if::cfg_if;

/// Line size used when the CPU does not report a usable one.
pub const DEFAULT_LINE_SIZE: usize = 32;

/// Cache maintenance primitives of the host CPU.
///
/// Features are discovered through the CPU's feature query, never from the
/// model or family number.
pub trait CacheOps {
    /// The CPU can flush a single cache line.
    fn has_clflush(&self) -> bool;

    /// The CPU can write back and invalidate the whole cache, and we are
    /// privileged enough to do it.
    fn has_wbinvd(&self) -> bool;

    /// Cache line size reported by the CPU, if any.
    fn reported_line_size(&self) -> Option<usize>;

    /// Write back and invalidate the line holding `addr`.
    fn clflush(&self, addr: *const u8);

    /// Write back and invalidate every cache line.
    fn wbinvd(&self);

    /// Store `byte` into `buf` the way a bus master would, bypassing
    /// whatever the CPU has cached.
    ///
    /// Only used by the coherency probe. The default is a volatile store,
    /// which is what a device write looks like to a coherent cache.
    fn simulate_device_write(&self, buf: &mut [u8], byte: u8) {
        for b in buf.iter_mut() {
            unsafe { core::ptr::write_volatile(b, byte) };
        }
    }
}

/// Clamp a reported line size to something sane.
///
/// Anything that is not a power of two between 16 and 128 bytes falls back
/// to [`DEFAULT_LINE_SIZE`].
pub fn resolve_line_size(reported: Option<usize>) -> usize {
    match reported {
        Some(size) if size.is_power_of_two() && (16..=128).contains(&size) => size,
        _ => DEFAULT_LINE_SIZE,
    }
}

cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use raw_cpuid::CpuId;

        /// [`CacheOps`] backed by the real instructions.
        ///
        /// `wbinvd` is privileged, so it is only offered on bare metal.
        #[derive(Clone, Copy, Debug)]
        pub struct X86CacheOps {
            clflush: bool,
            line_size: Option<usize>,
        }

        impl X86CacheOps {
            /// Query the CPU once.
            pub fn detect() -> Self {
                let features = CpuId::new().get_feature_info();
                let clflush = features.as_ref().is_some_and(|f| f.has_clflush());
                let line_size = features
                    .as_ref()
                    .filter(|f| f.has_clflush())
                    .map(|f| f.cflush_cache_line_size() as usize * 8);
                Self { clflush, line_size }
            }
        }

        impl CacheOps for X86CacheOps {
            fn has_clflush(&self) -> bool {
                self.clflush
            }

            fn has_wbinvd(&self) -> bool {
                cfg!(target_os = "none")
            }

            fn reported_line_size(&self) -> Option<usize> {
                self.line_size
            }

            fn clflush(&self, addr: *const u8) {
                if self.clflush {
                    unsafe {
                        core::arch::asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags))
                    };
                }
            }

            fn wbinvd(&self) {
                #[cfg(target_os = "none")]
                unsafe {
                    core::arch::asm!("wbinvd", options(nostack, preserves_flags))
                };
            }
        }
    }
}
