// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Cache maintenance hook used around ring buffers.

use cachesync::{CacheCoherency, CacheOps, MonotonicClock};
use dmaerrno::DmaResult;

/// Keeps ring buffers coherent between the CPU and the adapter.
pub trait BufferSync {
    /// The CPU has written `buf`; the adapter is about to read it.
    ///
    /// Work may be deferred until [`BufferSync::before_start`].
    fn for_device(&self, buf: &mut [u8]) -> DmaResult;

    /// The adapter has written `buf`; the CPU is about to read it.
    fn for_cpu(&self, buf: &mut [u8]) -> DmaResult;

    /// Finish deferred work before the adapter is told to fetch.
    fn before_start(&self) {}
}

impl<O: CacheOps, C: MonotonicClock> BufferSync for CacheCoherency<O, C> {
    fn for_device(&self, buf: &mut [u8]) -> DmaResult {
        self.defer_sync_for_device(buf)
    }

    fn for_cpu(&self, buf: &mut [u8]) -> DmaResult {
        self.sync_for_cpu(buf)
    }

    fn before_start(&self) {
        self.flush_before_start();
    }
}

impl<T: BufferSync + ?Sized> BufferSync for &T {
    fn for_device(&self, buf: &mut [u8]) -> DmaResult {
        (**self).for_device(buf)
    }

    fn for_cpu(&self, buf: &mut [u8]) -> DmaResult {
        (**self).for_cpu(buf)
    }

    fn before_start(&self) {
        (**self).before_start()
    }
}

/// Bus on which the adapter snoops CPU caches. Nothing to do.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoherentBus;

impl BufferSync for CoherentBus {
    fn for_device(&self, _buf: &mut [u8]) -> DmaResult {
        Ok(())
    }

    fn for_cpu(&self, _buf: &mut [u8]) -> DmaResult {
        Ok(())
    }
}
