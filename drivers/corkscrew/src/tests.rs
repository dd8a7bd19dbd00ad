// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use cachesync::{CacheCoherency, CacheOps, CacheTier, CoherencyConfig, MonotonicClock};
use dmaerrno::DmaError;

use crate::{
    regs::mock::{Access, MockPorts},
    *,
};

const IO_BASE: u16 = 0x300;
const MEM_BASE: u32 = 0x10000;

type Ring<S = CoherentBus> = RingContext<MockPorts, S>;

fn ring_with(config: RingConfig) -> (Ring, MockPorts) {
    let ports = MockPorts::default();
    let memory = RingMemory::hosted(&config, MEM_BASE);
    let ring = RingContext::init(IO_BASE, 10, config, ports.clone(), memory, CoherentBus).unwrap();
    (ring, ports)
}

fn ring() -> (Ring, MockPorts) {
    ring_with(RingConfig::default())
}

fn small() -> RingConfig {
    RingConfig {
        tx_ring_size: 4,
        rx_ring_size: 4,
        ..Default::default()
    }
}

fn commands(ports: &MockPorts) -> Vec<u16> {
    ports
        .writes()
        .into_iter()
        .filter_map(|a| match a {
            Access::Outw(port, word) if port == IO_BASE + regs::COMMAND => Some(word),
            _ => None,
        })
        .collect()
}

/// Play the adapter on the transmit ring: complete everything in flight.
fn complete_tx<S: BufferSync>(ring: &Ring<S>) {
    ring.tx.with(|l| {
        for n in 0..l.filled() {
            let i = l.dirty().wrapping_add(n) as usize % l.size() as usize;
            l.table.complete(i, 0);
        }
    });
}

/// Play the adapter on the receive ring: write `frame` into the oldest
/// posted buffer not yet used and mark it done.
fn receive<S: BufferSync>(ring: &Ring<S>, frame: &[u8], error: bool) {
    let (i, id) = ring.rx.with(|l| {
        let i = (0..l.filled())
            .map(|n| l.dirty().wrapping_add(n) as usize % l.size() as usize)
            .find(|&i| !l.table.get(i).is_complete())
            .unwrap();
        (i, l.slot(i).unwrap())
    });
    unsafe { ring.rx_arena.data_mut(id)[..frame.len()].copy_from_slice(frame) };
    let word = frame.len() as u32 | if error { desc::status::ERROR } else { 0 };
    ring.rx.with(|l| l.table.complete(i, word));
}

#[test]
fn init_programs_the_adapter() {
    let (ring, ports) = ring();
    assert_eq!(ring.state(), RingState::Ready);
    assert_eq!((ring.io_base(), ring.irq()), (IO_BASE, 10));
    let tx = ring.tx.with(|l| l.table.phys()).as_u32();
    let rx = ring.rx.with(|l| l.table.phys()).as_u32();
    assert_eq!((tx, rx), (MEM_BASE, MEM_BASE + 0x1000));
    assert_eq!(
        ports.writes(),
        [
            Access::Outw(IO_BASE + regs::COMMAND, regs::cmd::TOTAL_RESET),
            Access::Outw(
                IO_BASE + regs::COMMAND,
                regs::cmd::SELECT_WINDOW | regs::WINDOW_BUS_MASTER
            ),
            Access::Outl(IO_BASE + regs::DOWN_LIST_PTR, tx),
            Access::Outl(IO_BASE + regs::UP_LIST_PTR, rx),
        ]
    );
}

#[test]
fn rx_refill_binds_all_but_one_slot() {
    let (ring, _) = ring();
    assert_eq!(ring.filled_slots(DmaDirection::FromDevice), 15);
    assert_eq!(ring.free_slots(DmaDirection::FromDevice), 0);
    assert_eq!(ring.refill_rx().unwrap(), 0);
    let stats = ring.stats();
    assert_eq!(stats.total_allocations, 15);
    assert_eq!(stats.current_allocated, 15);
    assert_eq!(stats.peak_rx_usage, 15);
    assert!(ring.validate_zero_leaks().is_ok());
}

#[test]
fn hung_reset_fails_init() {
    let ports = MockPorts::default();
    ports.set_hung(true);
    let config = RingConfig::default();
    let memory = RingMemory::hosted(&config, MEM_BASE);
    let err = RingContext::init(IO_BASE, 10, config, ports, memory, CoherentBus).err();
    assert_eq!(err, Some(DmaError::HardwareTimeout));
}

#[test]
fn bad_geometry_is_rejected() {
    let config = RingConfig {
        tx_ring_size: 12,
        ..Default::default()
    };
    let memory = RingMemory::hosted(&RingConfig::default(), MEM_BASE);
    let err = RingContext::init(IO_BASE, 10, config, MockPorts::default(), memory, CoherentBus).err();
    assert_eq!(err, Some(DmaError::InvalidParameter));
}

#[test]
fn unreachable_descriptors_are_rejected() {
    let config = RingConfig::default();
    let mut memory = RingMemory::hosted(&config, MEM_BASE);
    memory.tx_descriptors = LinearAddr::new(0xFF80);
    let err = RingContext::init(IO_BASE, 10, config, MockPorts::default(), memory, CoherentBus).err();
    assert_eq!(err, Some(DmaError::SafetyViolation));
}

#[test]
fn tx_queue_and_reclaim() {
    let (ring, _) = ring();
    let frame: Vec<u8> = (0..100u8).collect();
    ring.queue_tx(&frame).unwrap();
    assert_eq!(ring.filled_slots(DmaDirection::ToDevice), 1);

    let (desc, id) = ring.tx.with(|l| (l.table.get(0), l.slot(0).unwrap()));
    assert_eq!(desc.status, desc::status::TX_INTR);
    assert_eq!(desc.length, 100);
    assert_eq!(desc.addr, ring.tx_arena.phys(id).as_u32());
    assert_eq!(unsafe { &ring.tx_arena.data_mut(id)[..100] }, &frame[..]);

    // Nothing finished yet.
    assert_eq!(ring.reclaim_tx(), 0);
    complete_tx(&ring);
    assert_eq!(ring.reclaim_tx(), 1);
    let stats = ring.stats();
    assert_eq!((stats.tx_packets, stats.tx_bytes), (1, 100));
    assert_eq!(stats.buffers_recycled, 1);
    assert_eq!(ring.filled_slots(DmaDirection::ToDevice), 0);
}

#[test]
fn tx_frame_length_is_checked() {
    let (ring, _) = ring();
    assert_eq!(ring.queue_tx(&[]), Err(DmaError::InvalidParameter));
    let jumbo = [0u8; RING_BUFFER_SIZE as usize + 1];
    assert_eq!(ring.queue_tx(&jumbo), Err(DmaError::InvalidParameter));
    assert!(ring.queue_tx(&[0u8; RING_BUFFER_SIZE as usize]).is_ok());
}

#[test]
fn full_tx_ring_backs_off() {
    let (ring, _) = ring_with(small());
    for _ in 0..3 {
        ring.queue_tx(&[1u8; 64]).unwrap();
    }
    assert_eq!(ring.queue_tx(&[1u8; 64]), Err(DmaError::ResourceExhausted));
    assert_eq!(ring.stats().ring_full_events, 1);
    complete_tx(&ring);
    assert_eq!(ring.reclaim_tx(), 3);
    assert!(ring.queue_tx(&[1u8; 64]).is_ok());
}

#[test]
fn batch_kicks_once() {
    let (mut ring, ports) = ring_with(small());
    ring.start().unwrap();
    ports.clear();
    let frames: [&[u8]; 5] = [&[1; 60], &[2; 61], &[3; 62], &[4; 63], &[5; 64]];
    assert_eq!(ring.queue_tx_batch(&frames).unwrap(), 3);
    assert_eq!(commands(&ports), [regs::cmd::START_DMA_DOWN]);
    assert_eq!(ring.queue_tx_batch(&frames), Err(DmaError::ResourceExhausted));
}

#[test]
fn start_and_stop_sequences() {
    let (mut ring, ports) = ring();
    ring.queue_tx(&[7u8; 60]).unwrap();
    ports.clear();
    ring.start().unwrap();
    assert_eq!(ring.state(), RingState::Active);
    use regs::cmd::*;
    assert_eq!(
        commands(&ports),
        [TX_ENABLE, RX_ENABLE, UP_UNSTALL, DOWN_UNSTALL, START_DMA_UP, START_DMA_DOWN]
    );
    assert_eq!(ring.start(), Err(DmaError::InvalidState));

    ports.clear();
    ring.queue_tx(&[8u8; 60]).unwrap();
    assert_eq!(commands(&ports), [START_DMA_DOWN]);

    ports.clear();
    ring.stop().unwrap();
    assert_eq!(ring.state(), RingState::Stopping);
    assert_eq!(commands(&ports), [TX_DISABLE, RX_DISABLE, DOWN_STALL, UP_STALL]);
    assert_eq!(ring.stop(), Err(DmaError::InvalidState));
    assert_eq!(ring.queue_tx(&[9u8; 60]), Err(DmaError::InvalidState));
    ring.start().unwrap();
}

#[test]
fn start_needs_dma_enabled() {
    let mut config = RingConfig::default();
    config.flags.remove(RingFlags::DMA_ENABLED);
    let (mut ring, _) = ring_with(config);
    assert_eq!(ring.start(), Err(DmaError::InvalidState));
    assert_eq!(ring.state(), RingState::Ready);
}

#[test]
fn rx_frames_reach_the_sink() {
    let (ring, _) = ring();
    let first: Vec<u8> = (0..60u8).collect();
    let second = [0x5Au8; 1514];
    receive(&ring, &first, false);
    receive(&ring, &second, false);

    let mut got = Vec::new();
    assert_eq!(ring.reclaim_rx(|frame| got.push(frame.to_vec())), 2);
    assert_eq!(got, [first.clone(), second.to_vec()]);

    let stats = ring.stats();
    assert_eq!((stats.rx_packets, stats.rx_bytes), (2, 60 + 1514));
    // Refilled on the way out.
    assert_eq!(ring.filled_slots(DmaDirection::FromDevice), 15);
    assert!(ring.validate_zero_leaks().is_ok());
}

#[test]
fn rx_errors_are_dropped() {
    let (ring, _) = ring();
    receive(&ring, &[1u8; 60], true);
    receive(&ring, &[2u8; 64], false);
    let mut got = Vec::new();
    assert_eq!(ring.reclaim_rx(|frame| got.push(frame.len())), 2);
    assert_eq!(got, [64]);
    let stats = ring.stats();
    assert_eq!((stats.rx_packets, stats.rx_errors), (1, 1));
}

#[test]
fn rx_without_auto_refill_drains() {
    let mut config = RingConfig::default();
    config.flags.remove(RingFlags::AUTO_REFILL);
    let (ring, _) = ring_with(config);
    receive(&ring, &[1u8; 60], false);
    assert_eq!(ring.reclaim_rx(|_| {}), 1);
    assert_eq!(ring.filled_slots(DmaDirection::FromDevice), 14);
    assert_eq!(ring.refill_rx().unwrap(), 1);
}

#[test]
fn ring_invariant_holds_under_load() {
    let (ring, _) = ring_with(small());
    for round in 0..500usize {
        let _ = ring.queue_tx(&[round as u8; 60]);
        if round % 3 == 0 {
            complete_tx(&ring);
            ring.reclaim_tx();
        }
        if round % 2 == 0 {
            receive(&ring, &[round as u8; 60], round % 7 == 0);
            ring.reclaim_rx(|_| {});
        }
        for dir in [DmaDirection::ToDevice, DmaDirection::FromDevice] {
            let filled = ring.filled_slots(dir);
            assert!(filled < 4, "{dir:?} filled {filled}");
            assert_eq!(filled + ring.free_slots(dir), 3);
        }
        assert!(ring.validate_zero_leaks().is_ok());
    }
}

#[test]
fn leak_free_teardown() {
    let (mut ring, _) = ring();
    ring.start().unwrap();
    for _ in 0..5 {
        ring.queue_tx(&[3u8; 128]).unwrap();
    }
    assert_eq!(ring.force_cleanup(), Err(DmaError::InvalidState));
    ring.stop().unwrap();
    assert_eq!(ring.force_cleanup().unwrap(), 5 + 15);
    assert!(ring.validate_zero_leaks().is_ok());
    assert_eq!(ring.filled_slots(DmaDirection::ToDevice), 0);
    let stats = ring.shutdown();
    assert_eq!(stats.leaked_buffers, 0);
    assert_eq!(stats.current_allocated, 0);
    assert_eq!(stats.total_allocations, stats.total_deallocations);
}

#[test]
fn shutdown_from_active() {
    let (mut ring, ports) = ring();
    ring.start().unwrap();
    ring.queue_tx(&[3u8; 128]).unwrap();
    ports.clear();
    let stats = ring.shutdown();
    assert_eq!(stats.current_allocated, 0);
    assert_eq!(
        commands(&ports),
        [
            regs::cmd::TX_DISABLE,
            regs::cmd::RX_DISABLE,
            regs::cmd::DOWN_STALL,
            regs::cmd::UP_STALL
        ]
    );
}

#[test]
fn leaks_are_reported() {
    let (ring, _) = ring();
    ring.rx.with(|l| l.unbind_silently(4));
    assert_eq!(ring.validate_zero_leaks(), Err(1));
    let stats = ring.stats();
    assert_eq!((stats.leaked_buffers, stats.buffer_leaks_detected), (1, 1));
}

#[test]
fn pool_expand_and_shrink() {
    let (ring, _) = ring();
    let tx = DmaDirection::ToDevice;
    assert_eq!(ring.tx.with(|l| l.pool.pool_size()), 32);
    assert_eq!(ring.expand_pool(tx, 8).unwrap(), 40);
    assert_eq!(ring.expand_pool(tx, 8).unwrap(), 48);
    assert_eq!(ring.expand_pool(tx, 1), Err(DmaError::ResourceExhausted));
    assert_eq!(ring.shrink_pool(tx, 33), Err(DmaError::InvalidParameter));
    assert_eq!(ring.shrink_pool(tx, 16).unwrap(), 32);
    assert_eq!(ring.shrink_pool(tx, 0), Err(DmaError::InvalidParameter));
    let stats = ring.stats();
    assert_eq!((stats.pool_expansions, stats.pool_shrinks), (2, 1));
}

#[test]
fn pool_expansion_can_be_disabled() {
    let mut config = RingConfig::default();
    config.flags.remove(RingFlags::POOL_AUTO_EXPAND);
    let (ring, _) = ring_with(config);
    assert_eq!(
        ring.expand_pool(DmaDirection::FromDevice, 8),
        Err(DmaError::InvalidState)
    );
    assert!(!ring.needs_expansion(DmaDirection::FromDevice));
}

#[test]
fn auto_manage_trims_idle_pools() {
    let (ring, _) = ring();
    // tx: 0 of 32 out. rx: 15 of 48 out, neither busy nor idle.
    assert!(ring.can_shrink(DmaDirection::ToDevice));
    assert!(!ring.can_shrink(DmaDirection::FromDevice));
    assert!(!ring.needs_expansion(DmaDirection::FromDevice));
    assert_eq!(ring.auto_manage(), 1);
    assert_eq!(ring.tx.with(|l| l.pool.pool_size()), 28);
}

#[test]
fn auto_manage_grows_busy_pools() {
    let (ring, _) = ring_with(small());
    // rx: 3 of 12 buffers posted; hold 7 more to push usage past 80 %.
    let held: Vec<_> = (0..7).map(|_| ring.rx.with(|l| l.pool.alloc().unwrap())).collect();
    assert!(ring.needs_expansion(DmaDirection::FromDevice));
    ring.auto_manage();
    assert_eq!(ring.rx.with(|l| l.pool.pool_size()), 14);
    ring.rx.with(|l| held.into_iter().for_each(|id| assert!(l.pool.free(id))));
}

#[test]
fn guard_damage_is_found() {
    let (ring, _) = ring();
    assert_eq!(ring.check_integrity(), 0);
    let id = ring.rx.with(|l| l.slot(0).unwrap());
    unsafe {
        let buf = ring.rx_arena.data_mut(id);
        buf.as_mut_ptr().add(buf.len()).write(0xFF);
    }
    assert_eq!(ring.check_integrity(), 1);
    assert_eq!(ring.stats().guard_violations, 1);
}

#[test]
fn reset_recovers_from_a_hung_adapter() {
    let (mut ring, ports) = ring();
    ring.start().unwrap();
    ring.queue_tx(&[1u8; 60]).unwrap();
    ports.set_hung(true);
    assert_eq!(ring.reset(), Err(DmaError::HardwareTimeout));
    assert_eq!(ring.state(), RingState::Error);
    assert_eq!(ring.refill_rx(), Err(DmaError::InvalidState));

    ports.set_hung(false);
    ports.clear();
    ring.reset().unwrap();
    assert_eq!(ring.state(), RingState::Ready);
    assert_eq!(ring.filled_slots(DmaDirection::ToDevice), 0);
    assert_eq!(ring.filled_slots(DmaDirection::FromDevice), 15);
    assert!(ring.validate_zero_leaks().is_ok());
    assert!(
        ports
            .writes()
            .contains(&Access::Outl(IO_BASE + regs::UP_LIST_PTR, MEM_BASE + 0x1000))
    );
}

struct FlushCounter {
    clflushes: Arc<AtomicUsize>,
}

impl CacheOps for FlushCounter {
    fn has_clflush(&self) -> bool {
        true
    }

    fn has_wbinvd(&self) -> bool {
        false
    }

    fn reported_line_size(&self) -> Option<usize> {
        Some(32)
    }

    fn clflush(&self, _addr: *const u8) {
        self.clflushes.fetch_add(1, Ordering::Relaxed);
    }

    fn wbinvd(&self) {}
}

struct Epoch;

impl MonotonicClock for Epoch {
    fn now_ms(&self) -> u64 {
        0
    }
}

#[test]
fn tx_buffers_are_flushed_before_publishing() {
    let clflushes = Arc::new(AtomicUsize::new(0));
    let ops = FlushCounter {
        clflushes: clflushes.clone(),
    };
    let mut scratch = [0u8; 64];
    let cache =
        CacheCoherency::init(ops, Epoch, CoherencyConfig::default(), &mut scratch).unwrap();
    assert_eq!(cache.tier(), CacheTier::LineFlush);

    let config = RingConfig::default();
    let memory = RingMemory::hosted(&config, MEM_BASE);
    let ring = RingContext::init(IO_BASE, 10, config, MockPorts::default(), memory, &cache).unwrap();
    ring.queue_tx(&[0xEEu8; 100]).unwrap();
    assert!(clflushes.load(Ordering::Relaxed) >= 4);
    assert_eq!(cache.stats().tx_syncs, 1);

    // The probe found receives coherent, so nothing is flushed for them.
    let before = clflushes.load(Ordering::Relaxed);
    receive(&ring, &[1u8; 60], false);
    assert_eq!(ring.reclaim_rx(|_| {}), 1);
    assert_eq!(clflushes.load(Ordering::Relaxed), before);
    assert_eq!(cache.stats().rx_syncs, 1);
    ring.shutdown();
}
