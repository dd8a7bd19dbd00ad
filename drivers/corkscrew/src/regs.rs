// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! 3C515-TX register map, the subset the ring manager drives.

/// Command register, every window. Reads return the status word.
pub const COMMAND: u16 = 0x0E;
/// Status register, same address as [`COMMAND`].
pub const STATUS: u16 = 0x0E;
/// Transmit (download) descriptor list pointer.
pub const DOWN_LIST_PTR: u16 = 0x404;
/// Receive (upload) descriptor list pointer.
pub const UP_LIST_PTR: u16 = 0x418;

/// Bus-master control window.
pub const WINDOW_BUS_MASTER: u16 = 7;

/// Command words. The opcode sits in bits 15..11.
pub mod cmd {
    pub const TOTAL_RESET: u16 = 0;
    pub const SELECT_WINDOW: u16 = 1 << 11;
    pub const RX_DISABLE: u16 = 3 << 11;
    pub const RX_ENABLE: u16 = 4 << 11;
    pub const UP_STALL: u16 = 6 << 11;
    pub const UP_UNSTALL: u16 = (6 << 11) + 1;
    pub const DOWN_STALL: u16 = (6 << 11) + 2;
    pub const DOWN_UNSTALL: u16 = (6 << 11) + 3;
    pub const TX_ENABLE: u16 = 9 << 11;
    pub const TX_DISABLE: u16 = 10 << 11;
    pub const START_DMA_UP: u16 = 20 << 11;
    pub const START_DMA_DOWN: u16 = (20 << 11) + 1;
}

/// Status word bits.
pub mod status {
    pub const CMD_IN_PROGRESS: u16 = 1 << 12;
}

/// Polls of [`status::CMD_IN_PROGRESS`] before a reset is declared hung.
pub const RESET_POLL_LIMIT: u32 = 1000;

/// Port I/O to the adapter.
///
/// `port` is absolute; callers add the adapter's base address.
pub trait PortIo {
    fn inw(&self, port: u16) -> u16;
    fn outw(&self, port: u16, value: u16);
    fn outl(&self, port: u16, value: u32);
}

/// The adapter's register file at `base`.
pub(crate) struct Regs<P: PortIo> {
    io: P,
    base: u16,
}

impl<P: PortIo> Regs<P> {
    pub fn new(io: P, base: u16) -> Self {
        Self { io, base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn command(&self, word: u16) {
        self.io.outw(self.base + COMMAND, word);
    }

    pub fn status(&self) -> u16 {
        self.io.inw(self.base + STATUS)
    }

    pub fn select_window(&self, window: u16) {
        self.command(cmd::SELECT_WINDOW | window);
    }

    pub fn write32(&self, reg: u16, value: u32) {
        self.io.outl(self.base + reg, value);
    }

    /// Issue a total reset and wait for the command to finish.
    pub fn reset(&self) -> bool {
        self.command(cmd::TOTAL_RESET);
        (0..RESET_POLL_LIMIT).any(|_| self.status() & status::CMD_IN_PROGRESS == 0)
    }
}
