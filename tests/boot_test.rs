//! ブートイメージ配置の統合テスト
//!
//! カーネルと DTB が規約どおりの位置へコピーされ、初期レジスタが
//! ARM Linux のブート契約に従って設定されることを確認する。

mod common;

use common::{build_vmm, try_build, MemRoms};
use vmm::board;

const RAM_SIZE: usize = 128 * 1024 * 1024;

#[test]
fn カーネルとdtbが規約の位置へ配置される() {
    let kernel = vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
    let dtb = vec![0xd0, 0x0d, 0xfe, 0xed];
    let mut f = build_vmm(RAM_SIZE, kernel, dtb);

    f.vmm.start().unwrap();

    let ram = f.vmm.vm().ram();
    assert_eq!(
        ram.read(0x8000, 4).unwrap(),
        &[0xde, 0xad, 0xbe, 0xef]
    );
    assert_eq!(
        ram.read(64 * 1024 * 1024, 2).unwrap(),
        &[0xd0, 0x0d]
    );
}

#[test]
fn 初期レジスタがブート契約どおりに設定される() {
    let mut f = build_vmm(RAM_SIZE, vec![0xde], vec![0xd0]);
    f.vmm.start().unwrap();

    let state = f.state.lock().unwrap();
    assert_eq!(state.ip, 0x8000_8000);
    assert_eq!(state.gpr[1], 2272);
    assert_eq!(state.gpr[2], 0x8400_0000);
    assert_eq!(state.cpsr, 0x93);
}

#[test]
fn vgicの初期状態が設定される() {
    let mut f = build_vmm(RAM_SIZE, vec![0], vec![0]);
    f.vmm.start().unwrap();

    let state = f.state.lock().unwrap();
    assert_eq!(state.gic_hcr, 0b101);
    assert_eq!(state.gic_vmcr, 0x4c_0000);
    assert_eq!(state.gic_apr, 0);
    assert_eq!(state.gic_elrsr0, 0b1111);
    assert!(state.gic_lr.iter().all(|lr| *lr == 0));
    assert_eq!(state.timer_ctrl, 0);
    assert_eq!(state.timer_val, 0);
    assert!(!state.timer_irq);
}

#[test]
fn ramとpicがゲスト空間へ接続される() {
    let f = build_vmm(RAM_SIZE, vec![0], vec![0]);

    let vcpu = f.vcpu.lock().unwrap();
    assert_eq!(vcpu.attached_ram, vec![(board::RAM_BASE, RAM_SIZE)]);
    assert_eq!(vcpu.attached_pic, Some(board::GICC_MMIO_BASE));
}

#[test]
fn start_でゲスト実行が開始される() {
    let mut f = build_vmm(RAM_SIZE, vec![0], vec![0]);
    assert_eq!(f.vcpu.lock().unwrap().runs, 0);

    f.vmm.start().unwrap();
    assert_eq!(f.vcpu.lock().unwrap().runs, 1);
}

#[test]
fn cp15のリセット値は構築時に状態へ入る() {
    let f = build_vmm(RAM_SIZE, vec![0], vec![0]);

    let state = f.state.lock().unwrap();
    assert_eq!(state.midr, 0x412f_c0f1);
    assert_eq!(state.mpidr, 0x4000_0000);
    assert_eq!(state.dacr, 0x5555_5555);
}

#[test]
fn romが欠けていると構築に失敗する() {
    let result = try_build(RAM_SIZE, MemRoms::empty());
    assert!(matches!(result, Err(vmm::error::VmmError::RomMissing(_))));
}

#[test]
fn ramに収まらないdtbはstartで失敗する() {
    // DTB は +64MiB に置かれるため 32MiB の RAM には入らない
    let mut f = build_vmm(32 * 1024 * 1024, vec![0], vec![0]);
    assert!(matches!(
        f.vmm.start(),
        Err(vmm::error::VmmError::RamOutOfRange { .. })
    ));
}

#[test]
fn 生成したデバイスツリーをdtb_romとして使える() {
    let dtb =
        vmm::boot::device_tree::generate_device_tree(&Default::default()).unwrap();
    let mut f = build_vmm(RAM_SIZE, vec![0xde, 0xad], dtb.clone());
    f.vmm.start().unwrap();

    let ram = f.vmm.vm().ram();
    // FDT マジックが 64MiB 地点に現れる
    assert_eq!(
        ram.read(64 * 1024 * 1024, 4).unwrap(),
        &[0xd0, 0x0d, 0xfe, 0xed]
    );
    assert_eq!(
        ram.read(64 * 1024 * 1024, dtb.len()).unwrap(),
        dtb.as_slice()
    );
}
