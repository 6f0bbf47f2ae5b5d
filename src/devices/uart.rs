//! PL011 UART device emulation
//!
//! TX bytes go straight to the terminal service; RX bytes are buffered in a
//! 1024-byte ring filled from the terminal's "data available" event. The
//! register file is 16 bits wide: word accessors forward to the halfword
//! path, byte writes are accepted for the data register only.

use std::collections::VecDeque;

use crate::board;
use crate::cpu::CpuState;
use crate::devices::gic::SharedGic;
use crate::error::VmmError;
use crate::mmio::MmioDevice;
use crate::services::Terminal;

/// RX ring capacity in bytes
const RX_BUF_SIZE: usize = 1024;

/// PL011 register offsets
mod regs {
    pub const DR: u64 = 0x0;
    pub const FR: u64 = 0x18;
    pub const IBRD: u64 = 0x24;
    pub const FBRD: u64 = 0x28;
    pub const LCR_H: u64 = 0x2c;
    pub const CR: u64 = 0x30;
    pub const IFLS: u64 = 0x34;
    pub const IMSC: u64 = 0x38;
    pub const MIS: u64 = 0x40;
    pub const ICR: u64 = 0x44;
    pub const PERIPHID0: u64 = 0xfe0;
    pub const PERIPHID1: u64 = 0xfe4;
    pub const PERIPHID2: u64 = 0xfe8;
    pub const PERIPHID3: u64 = 0xfec;
    pub const PCELLID0: u64 = 0xff0;
    pub const PCELLID1: u64 = 0xff4;
    pub const PCELLID2: u64 = 0xff8;
    pub const PCELLID3: u64 = 0xffc;
}

/// Interrupt bits (IMSC/RIS/MIS)
const INT_RX: u16 = 1 << 4;
const INT_TX: u16 = 1 << 5;

/// PL011 UART
pub struct Pl011 {
    base: u64,
    terminal: Box<dyn Terminal>,
    gic: SharedGic,
    rx_buf: VecDeque<u8>,
    ibrd: u16,
    fbrd: u16,
    lcr_h: u16,
    imsc: u16,
    ris: u16,
    cr: u16,
}

impl Pl011 {
    pub fn new(base: u64, terminal: Box<dyn Terminal>, gic: SharedGic) -> Self {
        Self {
            base,
            terminal,
            gic,
            rx_buf: VecDeque::with_capacity(RX_BUF_SIZE),
            ibrd: 0,
            fbrd: 0,
            lcr_h: 0,
            imsc: 0b1111,
            ris: 0,
            cr: 0x300,
        }
    }

    fn get_char(&mut self) -> u8 {
        self.rx_buf.pop_front().unwrap_or(0)
    }

    fn get(&mut self, offset: u64) -> Result<u16, VmmError> {
        match offset {
            regs::DR => Ok(self.get_char() as u16),
            regs::PERIPHID0 => Ok(0x11),
            regs::PERIPHID1 => Ok(0x10),
            regs::PERIPHID2 => Ok(0x14),
            regs::PERIPHID3 => Ok(0x0),
            regs::PCELLID0 => Ok(0xd),
            regs::PCELLID1 => Ok(0xf0),
            regs::PCELLID2 => Ok(0x5),
            regs::PCELLID3 => Ok(0xb1),
            regs::FR => Ok(if self.rx_buf.is_empty() { 16 } else { 64 }),
            regs::CR => Ok(self.cr),
            regs::IMSC => Ok(self.imsc),
            regs::MIS => Ok(self.ris & self.imsc),
            regs::FBRD => Ok(self.fbrd),
            regs::IBRD => Ok(self.ibrd),
            regs::LCR_H => Ok(self.lcr_h),
            _ => Err(VmmError::UnsupportedOffset {
                device: "pl011",
                offset,
            }),
        }
    }

    /// Apply an IMSC write
    ///
    /// A masked-to-unmasked transition raises the interrupt if the event is
    /// live: TX room is always available, RX only when the ring holds bytes.
    fn mask_irqs(&mut self, state: &mut CpuState, mask: u16) -> Result<(), VmmError> {
        if mask & INT_TX != 0 && self.imsc & INT_TX == 0 {
            self.inject_irq(state)?;
            self.ris |= INT_TX;
        }

        if mask & INT_RX != 0 && self.imsc & INT_RX == 0 && !self.rx_buf.is_empty() {
            self.inject_irq(state)?;
            self.ris |= INT_RX;
        }

        self.imsc = mask;
        Ok(())
    }

    /// Drain the terminal into the RX ring and raise the RX interrupt
    ///
    /// Stops while the ring is full; the terminal keeps the rest until the
    /// guest drains the FIFO (implicit back-pressure).
    pub fn handle_rx(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        if !self.terminal.avail() {
            return Ok(());
        }

        while self.terminal.avail() && self.rx_buf.len() < RX_BUF_SIZE {
            let mut byte = [0u8; 1];
            if self.terminal.read(&mut byte) == 0 {
                break;
            }
            self.rx_buf.push_back(byte[0]);
        }

        self.inject_irq(state)?;
        self.ris |= INT_RX;
        Ok(())
    }

    fn inject_irq(&self, state: &mut CpuState) -> Result<(), VmmError> {
        self.gic
            .lock()
            .map_err(|_| VmmError::LockPoisoned("gic"))?
            .inject(state, board::PL011_IRQ)
    }
}

impl MmioDevice for Pl011 {
    fn name(&self) -> &'static str {
        "pl011"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        board::PL011_MMIO_SIZE
    }

    fn read_u16(&mut self, _state: &mut CpuState, offset: u64) -> Result<u16, VmmError> {
        self.get(offset)
    }

    /// Word reads forward to the halfword register file
    fn read_u32(&mut self, state: &mut CpuState, offset: u64) -> Result<u32, VmmError> {
        self.read_u16(state, offset).map(u32::from)
    }

    fn write_u8(&mut self, _state: &mut CpuState, offset: u64, value: u8) -> Result<(), VmmError> {
        if offset != regs::DR {
            return Err(VmmError::UnsupportedAccessWidth {
                device: "pl011",
                width: 8,
                offset,
            });
        }
        self.terminal.write(&[value]);
        Ok(())
    }

    fn write_u16(&mut self, state: &mut CpuState, offset: u64, value: u16) -> Result<(), VmmError> {
        match offset {
            regs::DR => {
                self.terminal.write(&[value as u8]);
                Ok(())
            }
            regs::FBRD => {
                self.fbrd = value;
                Ok(())
            }
            regs::IMSC => self.mask_irqs(state, value),
            regs::IBRD => {
                self.ibrd = value;
                Ok(())
            }
            regs::LCR_H => {
                self.lcr_h = value;
                Ok(())
            }
            regs::ICR => {
                self.ris &= !value;
                Ok(())
            }
            regs::CR => {
                self.cr = value;
                Ok(())
            }
            regs::IFLS => Ok(()),
            _ => Err(VmmError::UnsupportedOffset {
                device: "pl011",
                offset,
            }),
        }
    }
}
