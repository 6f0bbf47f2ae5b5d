//! 統合テスト用のモックホストサービス
//!
//! VCPU・端末・単調タイマー・ROM をメモリ上で模倣し、ゲストの Exit を
//! 共有 CPU 状態へ直接書き込んで VMM を駆動します。

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use vmm::cpu::CpuState;
use vmm::error::VmmError;
use vmm::services::{Event, MonotonicTimer, RomProvider, SharedState, Terminal, VcpuService};
use vmm::Vmm;

/// cpu_exception: IRQ
pub const EXC_IRQ: u32 = 6;
/// cpu_exception: 同期トラップ
pub const EXC_TRAP: u32 = 8;

#[derive(Default)]
pub struct MockVcpuInner {
    pub runs: u32,
    pub pauses: u32,
    pub attached_ram: Vec<(u64, usize)>,
    pub attached_pic: Option<u64>,
}

pub struct MockVcpu {
    state: SharedState,
    inner: Arc<Mutex<MockVcpuInner>>,
}

impl VcpuService for MockVcpu {
    fn cpu_state(&self) -> SharedState {
        self.state.clone()
    }

    fn attach_ram(&mut self, guest_addr: u64, size: usize) -> Result<(), VmmError> {
        self.inner.lock().unwrap().attached_ram.push((guest_addr, size));
        Ok(())
    }

    fn attach_pic(&mut self, guest_addr: u64) -> Result<(), VmmError> {
        self.inner.lock().unwrap().attached_pic = Some(guest_addr);
        Ok(())
    }

    fn run(&mut self) {
        self.inner.lock().unwrap().runs += 1;
    }

    fn pause(&mut self) {
        self.inner.lock().unwrap().pauses += 1;
    }
}

#[derive(Default)]
pub struct MockTerminalInner {
    pub tx: Vec<u8>,
    pub rx: VecDeque<u8>,
}

pub struct MockTerminal(Arc<Mutex<MockTerminalInner>>);

impl Terminal for MockTerminal {
    fn write(&mut self, bytes: &[u8]) {
        self.0.lock().unwrap().tx.extend_from_slice(bytes);
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut inner = self.0.lock().unwrap();
        let mut n = 0;
        for slot in buf.iter_mut() {
            match inner.rx.pop_front() {
                Some(b) => {
                    *slot = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn avail(&self) -> bool {
        !self.0.lock().unwrap().rx.is_empty()
    }
}

#[derive(Default)]
pub struct MockTimer {
    pub scheduled: Mutex<Vec<u64>>,
    pub ms: Mutex<u64>,
}

impl MonotonicTimer for MockTimer {
    fn trigger_once(&self, microseconds: u64) {
        self.scheduled.lock().unwrap().push(microseconds);
    }

    fn elapsed_ms(&self) -> u64 {
        *self.ms.lock().unwrap()
    }
}

pub struct MemRoms(HashMap<String, Vec<u8>>);

impl MemRoms {
    pub fn new(kernel: Vec<u8>, dtb: Vec<u8>) -> Self {
        let mut roms = HashMap::new();
        roms.insert("linux".to_string(), kernel);
        roms.insert("dtb".to_string(), dtb);
        Self(roms)
    }

    pub fn empty() -> Self {
        Self(HashMap::new())
    }
}

impl RomProvider for MemRoms {
    fn request(&self, name: &str) -> Result<Vec<u8>, VmmError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| VmmError::RomMissing(name.to_string()))
    }
}

pub struct Fixture {
    pub vmm: Vmm,
    pub state: SharedState,
    pub vcpu: Arc<Mutex<MockVcpuInner>>,
    pub terminal: Arc<Mutex<MockTerminalInner>>,
    pub timer: Arc<MockTimer>,
}

/// モックサービスを配線して VMM を構築する
pub fn try_build(ram_size: usize, roms: MemRoms) -> Result<Fixture, VmmError> {
    let _ = env_logger::builder().is_test(true).try_init();

    let state: SharedState = Arc::new(Mutex::new(CpuState::default()));
    let vcpu_inner = Arc::new(Mutex::new(MockVcpuInner::default()));
    let terminal_inner = Arc::new(Mutex::new(MockTerminalInner::default()));
    let timer = Arc::new(MockTimer::default());

    let vmm = Vmm::new(
        Box::new(MockVcpu {
            state: state.clone(),
            inner: vcpu_inner.clone(),
        }),
        Box::new(MockTerminal(terminal_inner.clone())),
        timer.clone(),
        &roms,
        ram_size,
    )?;

    Ok(Fixture {
        vmm,
        state,
        vcpu: vcpu_inner,
        terminal: terminal_inner,
        timer,
    })
}

pub fn build_vmm(ram_size: usize, kernel: Vec<u8>, dtb: Vec<u8>) -> Fixture {
    try_build(ram_size, MemRoms::new(kernel, dtb)).expect("failed to build vmm")
}

/// CP15 トラップの HSR を組み立てる
pub fn cp15_hsr(crn: u32, op1: u32, crm: u32, op2: u32, reg: u32, read: bool) -> u32 {
    let mut hsr = (0x03 << 26)
        | ((crm & 0xf) << 1)
        | ((reg & 0xf) << 5)
        | ((crn & 0xf) << 10)
        | ((op1 & 0x7) << 14)
        | ((op2 & 0x7) << 17);
    if read {
        hsr |= 1;
    }
    hsr
}

/// データアボートの HSR を組み立てる (Valid=1)
pub fn da_hsr(write: bool, reg: u32, size: u32) -> u32 {
    let mut hsr = (0x24 << 26) | (1 << 24) | (size << 22) | ((reg & 0xf) << 16);
    if write {
        hsr |= 1 << 6;
    }
    hsr
}

/// WFI トラップの HSR
pub fn wfi_hsr() -> u32 {
    0x01 << 26
}

/// フォールトアドレスをシンドロームレジスタへ分解して書き込む
pub fn set_fault_addr(state: &mut CpuState, addr: u64) {
    state.hpfar = ((addr & !0xfff) >> 8) as u32;
    state.hdfar = (addr & 0xfff) as u32;
}

/// ゲストの MMIO 書き込みを 1 回の Exit として実行する (r0 経由)
pub fn mmio_write(f: &mut Fixture, addr: u64, value: u32, size: u32) {
    {
        let mut state = f.state.lock().unwrap();
        state.cpu_exception = EXC_TRAP;
        state.hsr = da_hsr(true, 0, size);
        set_fault_addr(&mut state, addr);
        state.gpr[0] = value;
    }
    f.vmm.handle_event(Event::VcpuExit);
}

/// ゲストの MMIO 読み取りを 1 回の Exit として実行する (r0 経由)
pub fn mmio_read(f: &mut Fixture, addr: u64, size: u32) -> u32 {
    {
        let mut state = f.state.lock().unwrap();
        state.cpu_exception = EXC_TRAP;
        state.hsr = da_hsr(false, 0, size);
        set_fault_addr(&mut state, addr);
        state.gpr[0] = 0;
    }
    f.vmm.handle_event(Event::VcpuExit);
    f.state.lock().unwrap().gpr[0]
}
