//! 仮想 GIC (Generic Interrupt Controller)
//!
//! ディストリビュータの MMIO サーフェスをエミュレートし、GICH リスト
//! レジスタを通してゲストへ割り込みを注入します。EOI はホストの
//! メンテナンス割り込みで報告され、リストレジスタを回収します。
//! SGI (0..15) は vGIC 自身が所有します。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::board;
use crate::cpu::{CpuState, NR_LIST_REGS};
use crate::error::VmmError;
use crate::mmio::{MmioDevice, SharedDevice};

/// 共有 GIC ハンドル。デバイスは構築時にこのハンドルを受け取って注入する
pub type SharedGic = Arc<Mutex<Gic>>;

/// サポートする最大割り込み番号
pub const MAX_IRQ: u32 = 256;
/// SGI の最終番号
const SGI_MAX: u32 = 15;

/// ディストリビュータのレジスタオフセット
mod gicd_regs {
    pub const CTLR: u64 = 0x000;
    pub const TYPER: u64 = 0x004;
    pub const ISENABLER0: u64 = 0x100;
    pub const ISENABLERL: u64 = 0x17c;
    pub const ICENABLER0: u64 = 0x180;
    pub const ICENABLERL: u64 = 0x1fc;
    pub const IPRIORITYR0: u64 = 0x400;
    pub const IPRIORITYRL: u64 = 0x7f8;
    pub const ITARGETSR0: u64 = 0x800;
    pub const ITARGETSRL: u64 = 0xbf8;
    pub const ICFGR2: u64 = 0xc08;
    pub const ICFGRL: u64 = 0xcfc;
}

/// GICH リストレジスタのフィールド
mod gich_lr {
    /// 仮想割り込み ID (ビット 0..9)
    pub fn virt_id(lr: u32) -> u32 {
        lr & 0x3ff
    }

    /// pending 状態のリストレジスタ値を組み立てる (優先度 0)
    pub fn pending(virt_id: u32, phys_id: u32) -> u32 {
        (virt_id & 0x3ff) | ((phys_id & 0x3ff) << 10) | (0b01 << 28)
    }
}

/// ゲスト CPU から見た割り込みの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuIrqState {
    Inactive,
    Pending,
}

/// ディストリビュータでの有効/無効
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistrState {
    Enabled,
    Disabled,
}

/// IRQ の所有者
#[derive(Clone)]
enum IrqOwner {
    /// vGIC 自身 (SGI)
    Vgic,
    /// 登録されたデバイス
    Device(SharedDevice),
}

struct Irq {
    cpu_state: CpuIrqState,
    distr_state: DistrState,
    owner: Option<IrqOwner>,
    eoi: bool,
}

/// 仮想 GIC
pub struct Gic {
    base: u64,
    irqs: Vec<Irq>,
    distr_enabled: bool,
    /// VCPU を再開させるためのウェイクハンドル
    active: Arc<AtomicBool>,
}

impl Gic {
    pub fn new(base: u64, active: Arc<AtomicBool>) -> Self {
        let irqs = (0..=MAX_IRQ)
            .map(|i| Irq {
                cpu_state: CpuIrqState::Inactive,
                distr_state: DistrState::Disabled,
                owner: (i <= SGI_MAX).then_some(IrqOwner::Vgic),
                eoi: false,
            })
            .collect();
        Self {
            base,
            irqs,
            distr_enabled: false,
            active,
        }
    }

    /// IRQ の所有デバイスと EOI 要求フラグを登録する
    pub fn register_irq(
        &mut self,
        irq: u32,
        device: SharedDevice,
        eoi: bool,
    ) -> Result<(), VmmError> {
        let entry = self
            .irqs
            .get_mut(irq as usize)
            .ok_or(VmmError::IrqOutOfBounds(irq))?;
        entry.owner = Some(IrqOwner::Device(device));
        entry.eoi = eoi;
        Ok(())
    }

    /// 割り込みをゲストへ注入する
    ///
    /// EOI を要求する IRQ は pending マークされ、メンテナンス EOI まで
    /// 再注入できない。ディストリビュータが無効なら警告して捨てる。
    /// 成功した注入 (と重複検出) は VCPU をアクティブへ戻す。
    pub fn inject(&mut self, state: &mut CpuState, irq: u32) -> Result<(), VmmError> {
        let eoi = {
            let entry = self
                .irqs
                .get_mut(irq as usize)
                .ok_or(VmmError::IrqOutOfBounds(irq))?;
            if entry.owner.is_none() {
                return Err(VmmError::UnknownInjection(irq));
            }
            if entry.cpu_state == CpuIrqState::Pending {
                return Err(VmmError::DoubleInject(irq));
            }
            if entry.eoi {
                entry.cpu_state = CpuIrqState::Pending;
            }
            if entry.distr_state == DistrState::Disabled {
                warn!("disabled irq {irq} injected");
                return Ok(());
            }
            entry.eoi
        };

        if irq == board::VT_TIMER_IRQ {
            state.timer_irq = false;
        }

        // 既に同じ仮想 ID が飛行中なら積み直さない
        for i in 0..NR_LIST_REGS {
            if state.gic_elrsr0 & (1 << i) == 0 && gich_lr::virt_id(state.gic_lr[i]) == irq {
                self.active.store(true, Ordering::Relaxed);
                return Ok(());
            }
        }

        for i in 0..NR_LIST_REGS {
            if state.gic_elrsr0 & (1 << i) == 0 {
                continue;
            }
            state.gic_elrsr0 &= !(1 << i);
            state.gic_lr[i] = gich_lr::pending(irq, if eoi { 1 << 9 } else { 0 });
            self.active.store(true, Ordering::Relaxed);
            return Ok(());
        }

        Err(VmmError::ListRegistersFull(irq))
    }

    /// IRQ Exit を処理する
    ///
    /// メンテナンス割り込みなら EOI 回収、仮想タイマー割り込みなら再注入。
    pub fn on_host_irq(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        match state.gic_irq {
            board::VT_MAINTENANCE_IRQ => self.handle_eoi(state),
            board::VT_TIMER_IRQ => self.inject(state, board::VT_TIMER_IRQ),
            irq => Err(VmmError::UnexpectedHostIrq(irq)),
        }
    }

    /// メンテナンス割り込み: EOI されたリストレジスタを回収する
    fn handle_eoi(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        if state.gic_misr & 1 == 0 {
            return Ok(());
        }

        for i in 0..NR_LIST_REGS {
            if state.gic_eisr & (1 << i) == 0 {
                continue;
            }
            let irq = gich_lr::virt_id(state.gic_lr[i]);
            if irq > MAX_IRQ {
                return Err(VmmError::IrqOutOfBounds(irq));
            }
            state.gic_lr[i] = 0;
            state.gic_elrsr0 |= 1 << i;
            if irq == board::VT_TIMER_IRQ
                && self.irqs[irq as usize].distr_state == DistrState::Enabled
            {
                state.timer_irq = true;
            }
            self.irqs[irq as usize].cpu_state = CpuIrqState::Inactive;
            if let Some(IrqOwner::Device(device)) = &self.irqs[irq as usize].owner {
                device
                    .lock()
                    .map_err(|_| VmmError::LockPoisoned("irq owner"))?
                    .irq_handled(irq);
            }
        }

        state.gic_misr = 0;
        Ok(())
    }

    fn enable_irq(&mut self, state: &mut CpuState, irq: u32) -> Result<(), VmmError> {
        let entry = self
            .irqs
            .get_mut(irq as usize)
            .ok_or(VmmError::IrqOutOfBounds(irq))?;
        if entry.owner.is_none() {
            return Err(VmmError::UnknownInjection(irq));
        }
        if entry.distr_state == DistrState::Enabled {
            return Ok(());
        }
        entry.distr_state = DistrState::Enabled;

        if let Some(IrqOwner::Device(device)) = entry.owner.clone() {
            device
                .lock()
                .map_err(|_| VmmError::LockPoisoned("irq owner"))?
                .irq_enabled(irq);
        }

        // 既に上がっていたタイマー割り込みをゲストへ見せる
        if irq == board::VT_TIMER_IRQ {
            state.timer_irq = true;
        }
        Ok(())
    }

    fn disable_irq(&mut self, state: &mut CpuState, irq: u32) -> Result<(), VmmError> {
        let entry = self
            .irqs
            .get_mut(irq as usize)
            .ok_or(VmmError::IrqOutOfBounds(irq))?;
        if entry.distr_state == DistrState::Disabled {
            return Ok(());
        }
        entry.distr_state = DistrState::Disabled;

        if let Some(IrqOwner::Device(device)) = entry.owner.clone() {
            device
                .lock()
                .map_err(|_| VmmError::LockPoisoned("irq owner"))?
                .irq_disabled(irq);
        }

        if irq == board::VT_TIMER_IRQ {
            state.timer_irq = false;
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_enabled(&self, irq: u32) -> bool {
        self.irqs[irq as usize].distr_state == DistrState::Enabled
    }

    #[cfg(test)]
    fn is_pending(&self, irq: u32) -> bool {
        self.irqs[irq as usize].cpu_state == CpuIrqState::Pending
    }
}

impl MmioDevice for Gic {
    fn name(&self) -> &'static str {
        "gic"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        board::GICD_MMIO_SIZE
    }

    fn read_u32(&mut self, _state: &mut CpuState, offset: u64) -> Result<u32, VmmError> {
        if (gicd_regs::ICFGR2..=gicd_regs::ICFGRL).contains(&offset) {
            return Ok(0);
        }

        if (gicd_regs::ISENABLER0..=gicd_regs::ISENABLERL).contains(&offset) {
            let first = (offset - gicd_regs::ISENABLER0) * 8;
            let mut value = 0;
            for i in 0..32u64 {
                let irq = first + i;
                if irq <= MAX_IRQ as u64
                    && self.irqs[irq as usize].distr_state == DistrState::Enabled
                {
                    value |= 1 << i;
                }
            }
            return Ok(value);
        }

        if (gicd_regs::ITARGETSR0..=gicd_regs::ITARGETSRL).contains(&offset) {
            // cpu0 のみ
            return Ok(0x0101_0101);
        }

        if (gicd_regs::IPRIORITYR0..=gicd_regs::IPRIORITYRL).contains(&offset) {
            return Ok(0);
        }

        match offset {
            gicd_regs::CTLR => Ok(self.distr_enabled as u32),
            gicd_regs::TYPER => Ok(0b101),
            _ => Err(VmmError::UnsupportedGicOffset(offset)),
        }
    }

    fn write_u32(&mut self, state: &mut CpuState, offset: u64, value: u32) -> Result<(), VmmError> {
        // ターゲットは cpu0 だけを許す
        if (gicd_regs::ITARGETSR0..=gicd_regs::ITARGETSRL).contains(&offset) {
            return if value == 0x0101_0101 {
                Ok(())
            } else {
                Err(VmmError::UnsupportedGicOffset(offset))
            };
        }

        // レベルトリガー・アクティブローだけを許す
        if (gicd_regs::ICFGR2..=gicd_regs::ICFGRL).contains(&offset) {
            return if value == 0 {
                Ok(())
            } else {
                Err(VmmError::UnsupportedGicOffset(offset))
            };
        }

        // 優先度設定は無視する
        if (gicd_regs::IPRIORITYR0..=gicd_regs::IPRIORITYRL).contains(&offset) {
            return Ok(());
        }

        if (gicd_regs::ISENABLER0..=gicd_regs::ISENABLERL).contains(&offset) {
            let first = (offset - gicd_regs::ISENABLER0) * 8;
            for i in 0..32 {
                if value & (1 << i) != 0 {
                    self.enable_irq(state, first as u32 + i)?;
                }
            }
            return Ok(());
        }

        if (gicd_regs::ICENABLER0..=gicd_regs::ICENABLERL).contains(&offset) {
            let first = (offset - gicd_regs::ICENABLER0) * 8;
            for i in 0..32 {
                if value & (1 << i) != 0 {
                    self.disable_irq(state, first as u32 + i)?;
                }
            }
            return Ok(());
        }

        match offset {
            gicd_regs::CTLR => {
                self.distr_enabled = value & 0b1 != 0;
                Ok(())
            }
            _ => Err(VmmError::UnsupportedGicOffset(offset)),
        }
    }
}
