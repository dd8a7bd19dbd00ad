// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Descriptor rings of the 3Com 3C515-TX ("Corkscrew") ISA bus master.
//!
//! The adapter walks two circular lists of [`DmaDescriptor`]s in host
//! memory: the download list for transmit and the upload list for receive.
//! A [`RingContext`] owns both lists, a buffer pool per direction and the
//! register file, and keeps the three in step:
//!
//! - transmit frames are copied into a pool buffer, made visible to the
//!   adapter and published with [`RingContext::queue_tx`];
//! - finished transmits are recycled by [`RingContext::reclaim_tx`];
//! - receive slots are kept full by [`RingContext::refill_rx`] and drained
//!   by [`RingContext::reclaim_rx`].
//!
//! Counters and slot bindings are shared with the completion interrupt and
//! only change inside an [`IrqLock`] section.
//!
//! ```
//! use corkscrew::{CoherentBus, RingConfig, RingContext, RingMemory, DmaDirection};
//! # use corkscrew::PortIo;
//! # struct Idle;
//! # impl PortIo for Idle {
//! #     fn inw(&self, _: u16) -> u16 { 0 }
//! #     fn outw(&self, _: u16, _: u16) {}
//! #     fn outl(&self, _: u16, _: u32) {}
//! # }
//!
//! let config = RingConfig::default();
//! let memory = RingMemory::hosted(&config, 0x10000);
//! let mut ring = RingContext::init(0x300, 10, config, Idle, memory, CoherentBus).unwrap();
//! assert_eq!(ring.filled_slots(DmaDirection::FromDevice), 15);
//! ring.start().unwrap();
//! ring.queue_tx(&[0u8; 60]).unwrap();
//! let stats = ring.shutdown();
//! assert_eq!(stats.leaked_buffers, 0);
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
pub mod desc;
mod pool;
mod regs;
mod ring;
mod stats;
mod sync;
#[cfg(test)]
mod tests;

use alloc::vec::Vec;

use dmaerrno::{DmaResult, dma_err, ensure};
use irqlock::IrqLock;
use isadma::{DmaConstraints, DmaRegion, LinearAddr, SafetyChecker, translate::PageLock};
use log::{debug, error, info, warn};

pub use self::{
    config::{
        DEFAULT_RING_SIZE, MAX_RING_SIZE, MIN_RING_SIZE, RX_POOL_FACTOR, RingConfig, RingFlags,
        RingMemory, TX_POOL_FACTOR,
    },
    desc::{DescriptorTable, DmaDescriptor},
    pool::{BufId, RING_BUFFER_SIZE},
    regs::PortIo,
    stats::RingStats,
    sync::{BufferSync, CoherentBus},
};
pub use isadma::DmaDirection;

use self::{
    config::{initial_pool, pool_capacity},
    pool::{BufferArena, RingBufferPool},
    regs::{DOWN_LIST_PTR, Regs, UP_LIST_PTR, WINDOW_BUS_MASTER, cmd},
    ring::Lane,
};

/// Lifecycle of the rings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RingState {
    Uninitialized,
    Initializing,
    /// Rings are set up; the adapter is not fetching.
    Ready,
    Active,
    Stopping,
    /// The adapter stopped answering. Only [`RingContext::reset`] helps.
    Error,
}

/// Both descriptor rings of one adapter.
pub struct RingContext<P: PortIo, S: BufferSync> {
    regs: Regs<P>,
    irq: u8,
    config: RingConfig,
    state: RingState,
    checker: SafetyChecker,
    sync: S,
    pins: Vec<PageLock>,
    tx_arena: BufferArena,
    rx_arena: BufferArena,
    tx: IrqLock<Lane>,
    rx: IrqLock<Lane>,
}

fn build_lane(
    direction: DmaDirection,
    descriptors: LinearAddr,
    buffers: DmaRegion,
    config: &RingConfig,
    checker: &SafetyChecker,
    pins: &mut Vec<PageLock>,
) -> DmaResult<(Lane, BufferArena)> {
    let (ring_size, factor) = match direction {
        DmaDirection::ToDevice => (config.tx_ring_size, TX_POOL_FACTOR),
        DmaDirection::FromDevice => (config.rx_ring_size, RX_POOL_FACTOR),
    };
    let table = DescriptorTable::new(ring_size, descriptors, checker, pins)?;
    let capacity = pool_capacity(ring_size, factor);
    let arena = BufferArena::new(
        buffers,
        capacity as usize,
        config.buffer_align(),
        checker,
        pins,
    )?;
    let pool = RingBufferPool::new(
        initial_pool(ring_size, factor),
        capacity,
        ring_size as u32,
        config.flags.contains(RingFlags::POOL_AUTO_EXPAND),
    );
    Ok((Lane::new(direction, table, pool), arena))
}

impl<P: PortIo, S: BufferSync> RingContext<P, S> {
    /// Reset the adapter at `io_base`, build both rings in `memory` and fill
    /// the receive ring.
    pub fn init(
        io_base: u16,
        irq: u8,
        config: RingConfig,
        io: P,
        memory: RingMemory,
        sync: S,
    ) -> DmaResult<Self> {
        config.validate()?;
        info!(
            "corkscrew: initializing rings at {:#x} irq {}, tx {} rx {}",
            io_base, irq, config.tx_ring_size, config.rx_ring_size
        );
        let regs = Regs::new(io, io_base);
        if !regs.reset() {
            error!("corkscrew: adapter at {:#x} did not finish reset", io_base);
            return dma_err!(HardwareTimeout, "total reset hung");
        }
        regs.select_window(WINDOW_BUS_MASTER);

        let RingMemory {
            translator,
            tx_descriptors,
            rx_descriptors,
            tx_buffers,
            rx_buffers,
        } = memory;
        let checker = SafetyChecker::new(translator, DmaConstraints::CORKSCREW);
        let mut pins = Vec::new();
        let lanes = build_lane(
            DmaDirection::ToDevice,
            tx_descriptors,
            tx_buffers,
            &config,
            &checker,
            &mut pins,
        )
        .and_then(|tx| {
            build_lane(
                DmaDirection::FromDevice,
                rx_descriptors,
                rx_buffers,
                &config,
                &checker,
                &mut pins,
            )
            .map(|rx| (tx, rx))
        });
        let ((tx, tx_arena), (rx, rx_arena)) = match lanes {
            Ok(lanes) => lanes,
            Err(err) => {
                for pin in pins {
                    checker.translator().unlock(pin);
                }
                return Err(err);
            }
        };

        let mut ring = Self {
            regs,
            irq,
            config,
            state: RingState::Initializing,
            checker,
            sync,
            pins,
            tx_arena,
            rx_arena,
            tx: IrqLock::new(tx),
            rx: IrqLock::new(rx),
        };
        ring.program_list_pointers();
        ring.state = RingState::Ready;
        let filled = ring.refill();
        let tx_pool = ring.tx.with(|l| l.pool.pool_size());
        let rx_pool = ring.rx.with(|l| l.pool.pool_size());
        info!(
            "corkscrew: rings ready, {} rx buffers posted, pools tx {} rx {}",
            filled, tx_pool, rx_pool
        );
        Ok(ring)
    }

    fn program_list_pointers(&self) {
        let tx = self.tx.with(|l| l.table.phys());
        let rx = self.rx.with(|l| l.table.phys());
        self.regs.write32(DOWN_LIST_PTR, tx.as_u32());
        self.regs.write32(UP_LIST_PTR, rx.as_u32());
        debug!("corkscrew: download list at {:?}, upload list at {:?}", tx, rx);
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn io_base(&self) -> u16 {
        self.regs.base()
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn sync(&self) -> &S {
        &self.sync
    }

    /// The checker that validated the ring memory.
    pub fn checker(&self) -> &SafetyChecker {
        &self.checker
    }

    fn lane(&self, direction: DmaDirection) -> &IrqLock<Lane> {
        match direction {
            DmaDirection::ToDevice => &self.tx,
            DmaDirection::FromDevice => &self.rx,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.state, RingState::Ready | RingState::Active)
    }

    fn refill(&self) -> u16 {
        let (bound, filled) = self.rx.with(|l| (l.refill(&self.rx_arena), l.filled()));
        if filled == 0 {
            warn!("corkscrew: rx ring empty, pool exhausted");
        }
        bound
    }

    /// Post fresh receive buffers. Returns how many were bound.
    ///
    /// An exhausted pool is not an error: it is counted and the next call
    /// tries again.
    pub fn refill_rx(&self) -> DmaResult<u16> {
        ensure!(self.is_running(), dma_err!(InvalidState, "rings not running"));
        Ok(self.refill())
    }

    /// Copy `frame` into a transmit buffer and hand it to the adapter.
    pub fn queue_tx(&self, frame: &[u8]) -> DmaResult {
        ensure!(self.is_running(), dma_err!(InvalidState, "rings not running"));
        self.queue_one(frame)?;
        self.kick_tx();
        Ok(())
    }

    /// Queue several frames and start the adapter once.
    ///
    /// Stops at the first frame that does not fit and returns how many were
    /// queued; fails only if none were.
    pub fn queue_tx_batch(&self, frames: &[&[u8]]) -> DmaResult<usize> {
        ensure!(self.is_running(), dma_err!(InvalidState, "rings not running"));
        let mut queued = 0;
        for frame in frames {
            match self.queue_one(frame) {
                Ok(()) => queued += 1,
                Err(err) if queued == 0 => return Err(err),
                Err(_) => break,
            }
        }
        self.kick_tx();
        Ok(queued)
    }

    fn queue_one(&self, frame: &[u8]) -> DmaResult {
        ensure!(
            !frame.is_empty() && frame.len() <= RING_BUFFER_SIZE as usize,
            dma_err!(InvalidParameter, "frame length")
        );
        let (index, id) = match self.tx.with(|l| l.reserve_tx()) {
            Ok(slot) => slot,
            Err(err) => {
                debug!("corkscrew: tx ring full or pool exhausted");
                return Err(err);
            }
        };

        // The slot is reserved but unpublished; nobody else touches the buffer.
        let buf = unsafe { &mut self.tx_arena.data_mut(id)[..frame.len()] };
        buf.copy_from_slice(frame);
        if let Err(err) = self.sync.for_device(buf) {
            self.tx.with(|l| l.cancel_tx(index));
            warn!("corkscrew: tx buffer sync failed: {:?}", err);
            return Err(err);
        }

        let phys = self.tx_arena.phys(id);
        self.tx.with(|l| l.publish_tx(index, phys, frame.len() as u32));
        Ok(())
    }

    fn kick_tx(&self) {
        if self.state == RingState::Active {
            self.sync.before_start();
            self.regs.command(cmd::START_DMA_DOWN);
        }
    }

    /// Recycle finished transmit buffers. Returns how many descriptors were
    /// taken back.
    pub fn reclaim_tx(&self) -> u16 {
        self.tx.with(|l| l.reclaim_tx())
    }

    /// Hand every finished receive frame to `sink`, then recycle its buffer.
    ///
    /// Frames the adapter flagged bad are counted and dropped. Returns how
    /// many descriptors were taken back.
    pub fn reclaim_rx(&self, mut sink: impl FnMut(&[u8])) -> u16 {
        let mut done = 0;
        while let Some(completion) = self.rx.with(|l| l.peek_rx()) {
            let delivered = match (completion.buf, completion.frame_len()) {
                (Some(id), Some(len)) => {
                    // Still bound to its slot until retired below.
                    let buf = unsafe { &mut self.rx_arena.data_mut(id)[..len] };
                    match self.sync.for_cpu(buf) {
                        Ok(()) => {
                            sink(&buf[..]);
                            true
                        }
                        Err(_) => false,
                    }
                }
                _ => false,
            };
            self.rx.with(|l| l.retire_rx(&completion, delivered));
            done += 1;
        }
        if done != 0 && self.is_running() && self.config.flags.contains(RingFlags::AUTO_REFILL) {
            self.refill();
        }
        done
    }

    /// Descriptors that can still be produced on a ring.
    pub fn free_slots(&self, direction: DmaDirection) -> u16 {
        self.lane(direction).with(|l| l.free())
    }

    /// Descriptors currently owned by the adapter.
    pub fn filled_slots(&self, direction: DmaDirection) -> u16 {
        self.lane(direction).with(|l| l.filled())
    }

    /// Grow a pool by `count` buffers from its reserve.
    pub fn expand_pool(&self, direction: DmaDirection, count: u32) -> DmaResult<u32> {
        let result = self.lane(direction).with(|l| {
            let result = l.pool.expand(count);
            if result.is_ok() {
                l.stats.pool_expansions += 1;
            }
            result
        });
        match result {
            Ok(size) => info!("corkscrew: {:?} pool expanded to {}", direction, size),
            Err(err) => warn!(
                "corkscrew: {:?} pool expansion by {} refused: {:?}",
                direction, count, err
            ),
        }
        result
    }

    /// Give `count` idle buffers of a pool back to the reserve.
    pub fn shrink_pool(&self, direction: DmaDirection, count: u32) -> DmaResult<u32> {
        let result = self.lane(direction).with(|l| {
            let result = l.pool.shrink(count);
            if result.is_ok() {
                l.stats.pool_shrinks += 1;
            }
            result
        });
        match result {
            Ok(size) => info!("corkscrew: {:?} pool shrunk to {}", direction, size),
            Err(err) => warn!(
                "corkscrew: {:?} pool shrink by {} refused: {:?}",
                direction, count, err
            ),
        }
        result
    }

    pub fn needs_expansion(&self, direction: DmaDirection) -> bool {
        self.lane(direction).with(|l| l.pool.needs_expansion())
    }

    pub fn can_shrink(&self, direction: DmaDirection) -> bool {
        self.lane(direction).with(|l| l.pool.can_shrink())
    }

    /// Grow busy pools and trim idle ones by one step each. Returns the
    /// number of pools changed.
    pub fn auto_manage(&self) -> u32 {
        let mut adjusted = 0;
        for direction in [DmaDirection::ToDevice, DmaDirection::FromDevice] {
            let step = self.lane(direction).with(|l| l.pool.expand_increment());
            let result = if self.needs_expansion(direction) {
                Some(self.expand_pool(direction, step))
            } else if self.can_shrink(direction) {
                Some(self.shrink_pool(direction, (step / 2).max(1)))
            } else {
                None
            };
            if let Some(Ok(_)) = result {
                adjusted += 1;
            }
        }
        adjusted
    }

    /// Cross-check every ring slot against its pool.
    ///
    /// Returns the number of mismatches found in both directions.
    pub fn validate_zero_leaks(&self) -> Result<(), u32> {
        let tx = self.tx.with(|l| {
            let leaks = l.leaks(&self.tx_arena);
            l.stats.leaked_buffers = leaks;
            l.stats.buffer_leaks_detected += leaks;
            leaks
        });
        let rx = self.rx.with(|l| {
            let leaks = l.leaks(&self.rx_arena);
            l.stats.leaked_buffers = leaks;
            l.stats.buffer_leaks_detected += leaks;
            leaks
        });
        match tx + rx {
            0 => Ok(()),
            total => {
                error!(
                    "corkscrew: {} buffer leaks detected (tx {}, rx {})",
                    total, tx, rx
                );
                Err(total)
            }
        }
    }

    fn unbind_all(&mut self) -> u32 {
        self.tx.get_mut().force_cleanup() + self.rx.get_mut().force_cleanup()
    }

    /// Unbind every slot of both rings whether or not the adapter finished
    /// with it. Refused while the adapter is running.
    pub fn force_cleanup(&mut self) -> DmaResult<u32> {
        ensure!(
            self.state != RingState::Active,
            dma_err!(InvalidState, "force cleanup on an active ring")
        );
        let freed = self.unbind_all();
        info!("corkscrew: forced cleanup released {} buffers", freed);
        Ok(freed)
    }

    /// Let the adapter fetch from both rings.
    pub fn start(&mut self) -> DmaResult {
        ensure!(
            matches!(self.state, RingState::Ready | RingState::Stopping),
            dma_err!(InvalidState, "rings cannot start from here")
        );
        ensure!(
            self.config.flags.contains(RingFlags::DMA_ENABLED),
            dma_err!(InvalidState, "bus-master DMA disabled")
        );
        self.regs.command(cmd::TX_ENABLE);
        self.regs.command(cmd::RX_ENABLE);
        self.regs.command(cmd::UP_UNSTALL);
        self.regs.command(cmd::DOWN_UNSTALL);
        self.regs.command(cmd::START_DMA_UP);
        self.state = RingState::Active;
        if self.filled_slots(DmaDirection::ToDevice) != 0 {
            self.kick_tx();
        }
        info!("corkscrew: rings active");
        Ok(())
    }

    /// Stop both directions. Descriptors stay bound.
    pub fn stop(&mut self) -> DmaResult {
        ensure!(
            self.state == RingState::Active,
            dma_err!(InvalidState, "rings not active")
        );
        self.regs.command(cmd::TX_DISABLE);
        self.regs.command(cmd::RX_DISABLE);
        self.regs.command(cmd::DOWN_STALL);
        self.regs.command(cmd::UP_STALL);
        self.state = RingState::Stopping;
        info!("corkscrew: rings stopped");
        Ok(())
    }

    /// Reset the adapter and rebuild the rings on the same memory.
    ///
    /// The way out of [`RingState::Error`]; also usable from any other state.
    pub fn reset(&mut self) -> DmaResult {
        if self.state == RingState::Active {
            self.stop()?;
        }
        let freed = self.unbind_all();
        debug!("corkscrew: reset released {} buffers", freed);
        if !self.regs.reset() {
            self.state = RingState::Error;
            error!(
                "corkscrew: adapter at {:#x} did not finish reset",
                self.regs.base()
            );
            return dma_err!(HardwareTimeout, "total reset hung");
        }
        self.regs.select_window(WINDOW_BUS_MASTER);
        self.program_list_pointers();
        self.state = RingState::Ready;
        let filled = self.refill();
        info!("corkscrew: rings reset, {} rx buffers posted", filled);
        Ok(())
    }

    /// Count ring buffers whose guard words were overwritten.
    pub fn check_integrity(&self) -> usize {
        let tx = self.tx_arena.damaged();
        let rx = self.rx_arena.damaged();
        if tx + rx != 0 {
            self.tx.with(|l| l.stats.guard_violations += tx as u32);
            self.rx.with(|l| l.stats.guard_violations += rx as u32);
            error!(
                "corkscrew: ring buffer guards overwritten (tx {}, rx {})",
                tx, rx
            );
        }
        tx + rx
    }

    /// Counters of both rings.
    pub fn stats(&self) -> RingStats {
        let tx = self.tx.with(|l| l.snapshot());
        let rx = self.rx.with(|l| l.snapshot());
        tx.merge(&rx)
    }

    /// Stop the adapter, release every buffer and page pin, and return the
    /// final counters.
    pub fn shutdown(mut self) -> RingStats {
        if self.state == RingState::Active {
            // Cannot fail: the state was just checked.
            let _ = self.stop();
        }
        let freed = self.unbind_all();
        debug!("corkscrew: shutdown released {} buffers", freed);

        if cfg!(feature = "leak-detection")
            && self.config.flags.contains(RingFlags::LEAK_DETECTION)
            && let Err(leaks) = self.validate_zero_leaks()
        {
            error!("corkscrew: {} leaks at shutdown", leaks);
        }

        let stats = self.stats();
        for pin in self.pins.drain(..) {
            self.checker.translator().unlock(pin);
        }
        self.state = RingState::Uninitialized;
        info!(
            "corkscrew: shutdown, tx {} packets, rx {} packets, {} leaked",
            stats.tx_packets, stats.rx_packets, stats.leaked_buffers
        );
        stats
    }
}
