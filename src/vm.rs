//! ゲスト VM
//!
//! ゲスト RAM とブートイメージの配置、VCPU の実行制御を担います。
//! カーネルは RAM+0x8000、DTB は RAM+64MiB へコピーされ、初期レジスタは
//! ARM Linux のブート規約 (r1=machine type, r2=DTB, SVC モード・IRQ 禁止)
//! に従って設定されます。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::board;
use crate::cpu::NR_LIST_REGS;
use crate::error::VmmError;
use crate::services::{RomProvider, SharedState, VcpuService};

/// ゲスト RAM (ホスト側バッキング)
pub struct GuestRam {
    base: u64,
    data: Vec<u8>,
}

impl GuestRam {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// RAM 内オフセットへバイト列を書き込む
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), VmmError> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(VmmError::RamOutOfRange {
                offset,
                len: bytes.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// RAM 内オフセットからバイト列を読む
    pub fn read(&self, offset: u64, len: usize) -> Result<&[u8], VmmError> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(VmmError::RamOutOfRange { offset, len })?;
        Ok(&self.data[start..end])
    }
}

/// ゲスト VM
pub struct Vm {
    vcpu: Box<dyn VcpuService>,
    state: SharedState,
    active: Arc<AtomicBool>,
    ram: GuestRam,
    kernel: Vec<u8>,
    dtb: Vec<u8>,
}

impl Vm {
    /// ROM を取得し、RAM と割り込みコントローラをゲスト空間へ接続する
    pub fn new(
        mut vcpu: Box<dyn VcpuService>,
        roms: &dyn RomProvider,
        ram_size: usize,
    ) -> Result<Self, VmmError> {
        let kernel = roms.request("linux")?;
        let dtb = roms.request("dtb")?;

        let ram = GuestRam::new(board::RAM_BASE, ram_size);
        vcpu.attach_ram(board::RAM_BASE, ram_size)?;
        vcpu.attach_pic(board::GICC_MMIO_BASE)?;
        let state = vcpu.cpu_state();

        Ok(Self {
            vcpu,
            state,
            active: Arc::new(AtomicBool::new(true)),
            ram,
            kernel,
            dtb,
        })
    }

    /// ブートイメージを配置し、初期レジスタと vGIC 初期状態を設定する
    pub fn start(&mut self) -> Result<(), VmmError> {
        self.ram.write(board::KERNEL_OFFSET, &self.kernel)?;
        self.ram.write(board::DTB_OFFSET, &self.dtb)?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| VmmError::LockPoisoned("cpu state"))?;
        state.reset_regs();

        state.ip = (board::RAM_BASE + board::KERNEL_OFFSET) as u32;
        state.gpr[1] = board::MACH_TYPE;
        state.gpr[2] = (board::RAM_BASE + board::DTB_OFFSET) as u32;
        // SVC モード、IRQ 禁止
        state.cpsr = 0x93;

        state.timer_ctrl = 0;
        state.timer_val = 0;
        state.timer_irq = false;

        state.gic_hcr = 0b101;
        state.gic_vmcr = 0x4c_0000;
        state.gic_misr = 0;
        state.gic_apr = 0;
        state.gic_eisr = 0;
        state.gic_lr = [0; NR_LIST_REGS];
        state.gic_elrsr0 = (1 << NR_LIST_REGS) - 1;

        info!("ready to run");
        Ok(())
    }

    /// アクティブならゲスト実行を再開する
    pub fn run(&mut self) {
        if self.active.load(Ordering::Relaxed) {
            self.vcpu.run();
        }
    }

    pub fn pause(&mut self) {
        self.vcpu.pause();
    }

    /// WFI: 次の割り込みまでゲストを停止する
    pub fn wait_for_interrupt(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn interrupt(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// 共有 CPU 状態ハンドル
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// VCPU を再開させるためのウェイクハンドル (vGIC が使う)
    pub fn wake_handle(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    /// CPU 状態全体をログへダンプする
    pub fn dump(&self) {
        if let Ok(state) = self.state.lock() {
            state.dump();
        }
    }
}
