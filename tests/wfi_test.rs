//! WFI 停止と再開の統合テスト
//!
//! WFI で VCPU が停止してホストタイマーが武装され、満了の注入で
//! PC が WFI の次の命令から再開されることを確認する。

mod common;

use common::{build_vmm, mmio_write, wfi_hsr, Fixture, EXC_TRAP};
use vmm::board;
use vmm::mmio::iss::SIZE_WORD;
use vmm::services::Event;

const RAM_SIZE: usize = 128 * 1024 * 1024;

fn fixture() -> Fixture {
    let mut f = build_vmm(RAM_SIZE, vec![0], vec![0]);
    f.vmm.start().unwrap();
    mmio_write(&mut f, board::GICD_MMIO_BASE, 0b1, SIZE_WORD);
    mmio_write(
        &mut f,
        board::GICD_MMIO_BASE + 0x100,
        1 << board::VT_TIMER_IRQ,
        SIZE_WORD,
    );
    f
}

/// タイマーを 1000 ティックで武装して WFI を実行する
fn wfi_with_timer(f: &mut Fixture) -> u32 {
    let ip_before;
    {
        let mut state = f.state.lock().unwrap();
        state.timer_ctrl = 1;
        state.timer_val = 1000;
        state.cpu_exception = EXC_TRAP;
        state.hsr = wfi_hsr();
        ip_before = state.ip;
    }
    f.vmm.handle_event(Event::VcpuExit);
    ip_before
}

#[test]
fn wfi_でvcpuが停止しタイマーが武装される() {
    let mut f = fixture();
    let runs_before = f.vcpu.lock().unwrap().runs;

    let ip_before = wfi_with_timer(&mut f);

    assert!(!f.vmm.vm().active());
    // PC は停止前に WFI の次へ進む
    assert_eq!(f.state.lock().unwrap().ip, ip_before + 4);
    // 1000 ティック / 24 = 41 µs のワンショット
    assert_eq!(*f.timer.scheduled.lock().unwrap(), vec![41]);
    // 停止中は再開されない
    assert_eq!(f.vcpu.lock().unwrap().runs, runs_before);
}

#[test]
fn タイマー満了で停止中のvcpuが再開される() {
    let mut f = fixture();
    let ip_before = wfi_with_timer(&mut f);
    let runs_before = f.vcpu.lock().unwrap().runs;

    f.vmm.handle_event(Event::TimerExpired);

    let state = f.state.lock().unwrap();
    // タイマービューは満了状態へ
    assert_eq!(state.timer_ctrl, 5);
    assert_eq!(state.timer_val, 0xffff_ffff);
    // 仮想タイマー IRQ がリストレジスタへ載る
    assert_eq!(state.gic_lr[0] & 0x3ff, board::VT_TIMER_IRQ);
    assert_eq!(state.gic_elrsr0, 0b1110);
    // PC は WFI の次のまま
    assert_eq!(state.ip, ip_before + 4);
    drop(state);

    assert!(f.vmm.vm().active());
    assert_eq!(f.vcpu.lock().unwrap().runs, runs_before + 1);
}

#[test]
fn アサート済みタイマーでは武装されない() {
    let mut f = fixture();
    {
        let mut state = f.state.lock().unwrap();
        state.timer_ctrl = 0b101;
        state.timer_val = 1000;
        state.cpu_exception = EXC_TRAP;
        state.hsr = wfi_hsr();
    }
    f.vmm.handle_event(Event::VcpuExit);

    assert!(!f.vmm.vm().active());
    assert!(f.timer.scheduled.lock().unwrap().is_empty());
}

#[test]
fn wfe_はディスパッチを中断する() {
    let mut f = fixture();
    let runs_before = f.vcpu.lock().unwrap().runs;
    let ip_before = f.state.lock().unwrap().ip;

    {
        let mut state = f.state.lock().unwrap();
        state.cpu_exception = EXC_TRAP;
        state.hsr = wfi_hsr() | 1;
    }
    f.vmm.handle_event(Event::VcpuExit);

    // WFE は未実装: PC は進まず VCPU も再開されない
    assert!(f.vmm.vm().active());
    assert_eq!(f.state.lock().unwrap().ip, ip_before);
    assert_eq!(f.vcpu.lock().unwrap().runs, runs_before);
}
