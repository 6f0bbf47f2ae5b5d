//! 仮想 Generic Timer エミュレーション
//!
//! ゲストの CNTV ビュー (timer_ctrl / timer_val) からホストのワンショット
//! タイマーを武装し、満了時に仮想タイマー割り込み (IRQ 27) を vGIC へ
//! 注入します。ゲストティックは 24 MHz。

use std::sync::Arc;

use crate::board;
use crate::cpu::CpuState;
use crate::devices::gic::SharedGic;
use crate::error::VmmError;
use crate::mmio::MmioDevice;
use crate::services::MonotonicTimer;

/// timer_ctrl: タイマー有効
const CTL_ENABLE: u32 = 1 << 0;
/// timer_ctrl: 割り込みアサート済み
const CTL_ISTATUS: u32 = 1 << 2;

/// 仮想 Generic Timer
pub struct GenericTimer {
    base: u64,
    timer: Arc<dyn MonotonicTimer>,
    gic: SharedGic,
}

impl GenericTimer {
    pub fn new(base: u64, timer: Arc<dyn MonotonicTimer>, gic: SharedGic) -> Self {
        Self { base, timer, gic }
    }

    /// WFI 進入時にホストタイマーを武装する
    ///
    /// 割り込みが既にアサートされている場合を除き、ゲストの残りティックを
    /// マイクロ秒へ変換してワンショットを仕掛ける。
    pub fn schedule_timeout(&self, state: &CpuState) {
        if (state.timer_ctrl & (CTL_ENABLE | CTL_ISTATUS)) != (CTL_ENABLE | CTL_ISTATUS) {
            self.timer
                .trigger_once((state.timer_val / board::TIMER_TICKS_PER_US) as u64);
        }
    }

    /// ホストタイマーの満了を処理する
    pub fn handle_timeout(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        state.timer_ctrl = CTL_ENABLE | CTL_ISTATUS;
        state.timer_val = 0xffff_ffff;
        self.gic
            .lock()
            .map_err(|_| VmmError::LockPoisoned("gic"))?
            .inject(state, board::VT_TIMER_IRQ)
    }
}

impl MmioDevice for GenericTimer {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        board::TIMER_MMIO_SIZE
    }

    // タイマーレジスタはホストが Exit 毎に状態へ写すため、MMIO レジスタは
    // 公開しない。領域へのアクセスはデフォルトフックで失敗する。
}
