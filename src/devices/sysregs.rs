//! VersaTile Express システムレジスタブロック
//!
//! マザーボードのコンフィグレーションコントローラをエミュレートします。
//! OSCCLK/VOLT の問い合わせは固定テーブルで応答し、24 MHz カウンタは
//! ホストの経過ミリ秒から合成します。LED・MCI などはスタブです。

use std::sync::Arc;

use crate::board;
use crate::cpu::CpuState;
use crate::error::VmmError;
use crate::mmio::MmioDevice;
use crate::services::MonotonicTimer;

mod sys_regs {
    pub const LED: u64 = 0x8;
    pub const MCI: u64 = 0x48;
    pub const FLASH: u64 = 0x4c;
    pub const MHZ24: u64 = 0x5c;
    pub const MISC: u64 = 0x60;
    pub const PROCID0: u64 = 0x84;
    pub const CFGDATA: u64 = 0xa0;
    pub const CFGCTRL: u64 = 0xa4;
    pub const CFGSTAT: u64 = 0xa8;
}

/// SYS_CFGCTRL のフィールド
mod cfgctrl {
    pub fn device(value: u32) -> u32 {
        value & 0xfff
    }

    pub fn function(value: u32) -> u32 {
        (value >> 20) & 0x3f
    }

    pub fn is_write(value: u32) -> bool {
        value & (1 << 30) != 0
    }

    pub fn start(value: u32) -> bool {
        value & (1 << 31) != 0
    }
}

/// システムレジスタブロック
pub struct SystemRegisters {
    base: u64,
    timer: Arc<dyn MonotonicTimer>,
    cfg_data: u32,
    cfg_stat: u32,
}

impl SystemRegisters {
    pub fn new(base: u64, timer: Arc<dyn MonotonicTimer>) -> Self {
        Self {
            base,
            timer,
            cfg_data: 0,
            cfg_stat: 1,
        }
    }

    /// MCC トランザクションを実行し、結果を CFGDATA へ置く
    fn mcc_control(&mut self, device: u32, function: u32, write: bool) -> Result<(), VmmError> {
        if function == 1 && !write {
            // クロックジェネレータの周波数問い合わせ
            self.cfg_data = match device {
                0 => 60_000_000,
                2 => 24_000_000,
                4 => 40_000_000,
                5 => 23_750_000,
                6 => 50_000_000,
                7 => 60_000_000,
                8 => 40_000_000,
                _ => {
                    return Err(VmmError::UnsupportedMcc {
                        device,
                        function,
                        write,
                    })
                }
            };
            return Ok(());
        }

        if function == 2 && !write && device == 0 {
            // VOLT0
            self.cfg_data = 900_000;
            return Ok(());
        }

        Err(VmmError::UnsupportedMcc {
            device,
            function,
            write,
        })
    }
}

impl MmioDevice for SystemRegisters {
    fn name(&self) -> &'static str {
        "sysregs"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        board::SYSREGS_MMIO_SIZE
    }

    fn read_u32(&mut self, _state: &mut CpuState, offset: u64) -> Result<u32, VmmError> {
        match offset {
            sys_regs::LED => Ok(0xff),
            sys_regs::FLASH => Ok(0),
            sys_regs::MHZ24 => Ok(self.timer.elapsed_ms().wrapping_mul(24_000) as u32),
            sys_regs::MISC => Ok(1 << 12),
            // daughterboard ID
            sys_regs::PROCID0 => Ok(0x1400_0237),
            // MMC なし
            sys_regs::MCI => Ok(0),
            sys_regs::CFGSTAT => Ok(self.cfg_stat),
            sys_regs::CFGCTRL => Ok(0),
            sys_regs::CFGDATA => Ok(self.cfg_data),
            _ => Err(VmmError::UnsupportedOffset {
                device: self.name(),
                offset,
            }),
        }
    }

    fn write_u32(&mut self, _state: &mut CpuState, offset: u64, value: u32) -> Result<(), VmmError> {
        match offset {
            sys_regs::CFGDATA => {
                self.cfg_data = value;
                Ok(())
            }
            sys_regs::CFGSTAT => {
                self.cfg_stat = value;
                Ok(())
            }
            sys_regs::CFGCTRL if cfgctrl::start(value) => {
                self.cfg_stat = 1;
                self.mcc_control(
                    cfgctrl::device(value),
                    cfgctrl::function(value),
                    cfgctrl::is_write(value),
                )
            }
            _ => Err(VmmError::UnsupportedOffset {
                device: self.name(),
                offset,
            }),
        }
    }
}
