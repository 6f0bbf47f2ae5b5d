//! ユーザーレベル ARMv7 仮想マシンモニタ
//!
//! ホストのハードウェア仮想化 VCPU の上でゲスト Linux を走らせる
//! trap-and-emulate ループを実装します。CP15 トラップ・HVC・WFI・
//! Stage-2 データアボートを復号して処理し、MMIO はエミュレートされた
//! ペリフェラル (GIC ディストリビュータ・Generic Timer・VersaTile
//! システムレジスタ・PL011) へディスパッチします。ゲストへの割り込みは
//! GICH リストレジスタを通して注入されます。
//!
//! ホスト側の VCPU・端末・単調タイマー・ROM は [`services`] の trait で
//! 注入され、すべてのイベントは単一スレッドのループで順番に処理されます。

pub mod board;
pub mod boot;
pub mod cp15;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod mmio;
pub mod services;
pub mod vm;

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::cp15::Cp15;
use crate::cpu::{hsr, CpuState, Exception};
use crate::devices::gic::{Gic, SharedGic};
use crate::devices::sysregs::SystemRegisters;
use crate::devices::timer::GenericTimer;
use crate::devices::uart::Pl011;
use crate::error::VmmError;
use crate::mmio::{DeviceMap, SharedDevice};
use crate::services::{Event, MonotonicTimer, RomProvider, Terminal, VcpuService};
use crate::vm::Vm;

/// 仮想マシンモニタ
///
/// 構築時にすべての外部サービスハンドルを受け取り、デバイスを MMIO
/// マップへ登録して IRQ の所有関係を配線する。
pub struct Vmm {
    vm: Vm,
    cp15: Cp15,
    devices: DeviceMap,
    gic: SharedGic,
    timer: Arc<Mutex<GenericTimer>>,
    uart: Arc<Mutex<Pl011>>,
}

impl Vmm {
    /// VMM を構築する
    ///
    /// # Arguments
    /// * `vcpu` - ハードウェア仮想化コンテキストを所有するホストサービス
    /// * `terminal` - ゲストシリアルを接続するバイト端末
    /// * `timer` - ワンショットタイムアウトと経過ミリ秒を提供する単調タイマー
    /// * `roms` - "linux" と "dtb" のブロブ提供元
    /// * `ram_size` - ゲスト RAM のサイズ (bytes)
    pub fn new(
        vcpu: Box<dyn VcpuService>,
        terminal: Box<dyn Terminal>,
        timer: Arc<dyn MonotonicTimer>,
        roms: &dyn RomProvider,
        ram_size: usize,
    ) -> Result<Self, VmmError> {
        let vm = Vm::new(vcpu, roms, ram_size)?;

        let cp15 = {
            let state = vm.state();
            let mut state = state
                .lock()
                .map_err(|_| VmmError::LockPoisoned("cpu state"))?;
            Cp15::new(&mut state)
        };

        let gic: SharedGic = Arc::new(Mutex::new(Gic::new(
            board::GICD_MMIO_BASE,
            vm.wake_handle(),
        )));
        let timer_dev = Arc::new(Mutex::new(GenericTimer::new(
            board::TIMER_MMIO_BASE,
            timer.clone(),
            gic.clone(),
        )));
        let sys_regs = Arc::new(Mutex::new(SystemRegisters::new(
            board::SYSREGS_MMIO_BASE,
            timer,
        )));
        let uart = Arc::new(Mutex::new(Pl011::new(
            board::PL011_MMIO_BASE,
            terminal,
            gic.clone(),
        )));

        {
            let mut gic_ref = gic.lock().map_err(|_| VmmError::LockPoisoned("gic"))?;
            let timer_owner: SharedDevice = timer_dev.clone();
            gic_ref.register_irq(board::VT_TIMER_IRQ, timer_owner, true)?;
            let uart_owner: SharedDevice = uart.clone();
            gic_ref.register_irq(board::PL011_IRQ, uart_owner, false)?;
        }

        let mut devices = DeviceMap::new();
        devices.insert(gic.clone() as SharedDevice)?;
        devices.insert(timer_dev.clone() as SharedDevice)?;
        devices.insert(sys_regs as SharedDevice)?;
        devices.insert(uart.clone() as SharedDevice)?;

        Ok(Self {
            vm,
            cp15,
            devices,
            gic,
            timer: timer_dev,
            uart,
        })
    }

    /// ブートイメージを配置してゲスト実行を開始する
    pub fn start(&mut self) -> Result<(), VmmError> {
        info!("Start virtual machine ...");
        self.vm.start()?;
        self.vm.run();
        Ok(())
    }

    /// イベントループ: チャネルが閉じるまでイベントを処理し続ける
    pub fn run(&mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            self.handle_event(event);
        }
    }

    /// 単一のイベントを処理する
    ///
    /// ハンドラの失敗は現在のディスパッチを中断し、CPU 状態をダンプして
    /// ループへ戻る。その場合 VCPU は再開されない。
    pub fn handle_event(&mut self, event: Event) {
        if let Err(err) = self.process_event(event) {
            error!("{err}");
            self.vm.dump();
            return;
        }

        if self.vm.active() {
            self.vm.run();
        }
    }

    fn process_event(&mut self, event: Event) -> Result<(), VmmError> {
        // 走行中なら停止して Exit を処理する。WFI で停止済みならイベント
        // ハンドラだけを走らせる。
        if self.vm.active() {
            self.vm.pause();
            self.handle_exit()?;
        }

        match event {
            Event::VcpuExit => Ok(()),
            Event::TimerExpired => {
                let shared = self.vm.state();
                let mut state = shared
                    .lock()
                    .map_err(|_| VmmError::LockPoisoned("cpu state"))?;
                self.timer
                    .lock()
                    .map_err(|_| VmmError::LockPoisoned("timer"))?
                    .handle_timeout(&mut state)
            }
            Event::TerminalRx => {
                let shared = self.vm.state();
                let mut state = shared
                    .lock()
                    .map_err(|_| VmmError::LockPoisoned("cpu state"))?;
                self.uart
                    .lock()
                    .map_err(|_| VmmError::LockPoisoned("uart"))?
                    .handle_rx(&mut state)
            }
        }
    }

    /// VM Exit を処理する
    pub fn handle_exit(&mut self) -> Result<(), VmmError> {
        let shared = self.vm.state();
        let mut state = shared
            .lock()
            .map_err(|_| VmmError::LockPoisoned("cpu state"))?;

        match Exception::from_raw(state.cpu_exception) {
            Some(Exception::Irq) => self
                .gic
                .lock()
                .map_err(|_| VmmError::LockPoisoned("gic"))?
                .on_host_irq(&mut state),
            Some(Exception::Trap) => self.handle_trap(&mut state),
            _ => Err(VmmError::UnexpectedException(state.cpu_exception)),
        }
    }

    /// 同期トラップを例外クラスで振り分ける
    fn handle_trap(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        match hsr::ec(state.hsr) {
            hsr::EC_HVC => Err(VmmError::UnknownHyperCall),
            hsr::EC_CP15 => {
                self.cp15.handle_trap(state)?;
                state.ip = state.ip.wrapping_add(4);
                Ok(())
            }
            hsr::EC_DA => self.handle_data_abort(state),
            hsr::EC_WFI => self.handle_wfi(state),
            ec => Err(VmmError::UnknownTrap(ec)),
        }
    }

    /// Stage-2 データアボート: フォールト IPA のデバイスへディスパッチする
    fn handle_data_abort(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        let ipa = (state.hpfar as u64) << 8;
        let fault = ipa | (state.hdfar as u64 & 0xfff);

        let device = self
            .devices
            .find(fault)?
            .ok_or(VmmError::NoDeviceAtIpa(fault))?;
        device
            .lock()
            .map_err(|_| VmmError::LockPoisoned("device"))?
            .handle_memory_access(state)?;

        state.ip = state.ip.wrapping_add(4);
        Ok(())
    }

    /// WFI: VCPU を停止し、仮想タイマーを武装して PC を進める
    fn handle_wfi(&mut self, state: &mut CpuState) -> Result<(), VmmError> {
        if state.hsr & 1 != 0 {
            return Err(VmmError::WfeNotImplemented);
        }

        self.vm.wait_for_interrupt();
        self.timer
            .lock()
            .map_err(|_| VmmError::LockPoisoned("timer"))?
            .schedule_timeout(state);
        state.ip = state.ip.wrapping_add(4);
        Ok(())
    }

    /// 割り込みをゲストへ注入する
    ///
    /// 注入された IRQ は次の VCPU エントリ以降でゲストから見える。
    pub fn inject(&mut self, irq: u32) -> Result<(), VmmError> {
        let shared = self.vm.state();
        let mut state = shared
            .lock()
            .map_err(|_| VmmError::LockPoisoned("cpu state"))?;
        self.gic
            .lock()
            .map_err(|_| VmmError::LockPoisoned("gic"))?
            .inject(&mut state, irq)
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// 共有 GIC ハンドル
    pub fn gic(&self) -> SharedGic {
        self.gic.clone()
    }
}
