//! CP15 コプロセッサレジスタファイル
//!
//! トラップされた MRC/MCR アクセスをシンドロームのエンコーディングで
//! 引き、共有 CPU 状態のミラーフィールドで読み書きを裏付けます。
//! リセット値は構築時に状態へ書き込まれます。

use std::collections::BTreeMap;

use crate::cpu::CpuState;
use crate::error::VmmError;

/// CP15 トラップの ISS フィールド
///
/// crn/op1/crm/op2 をアーキテクチャのビット位置へ配置した 32 ビット値を
/// ルックアップキーとして使う。
mod iss {
    /// Direction==1 は読み取り (MRC)
    pub fn is_read(hsr: u32) -> bool {
        hsr & 1 != 0
    }

    pub fn crm(hsr: u32) -> u32 {
        (hsr >> 1) & 0xf
    }

    /// 転送元/先レジスタ番号
    pub fn reg(hsr: u32) -> usize {
        ((hsr >> 5) & 0xf) as usize
    }

    pub fn crn(hsr: u32) -> u32 {
        (hsr >> 10) & 0xf
    }

    pub fn op1(hsr: u32) -> u32 {
        (hsr >> 14) & 0x7
    }

    pub fn op2(hsr: u32) -> u32 {
        (hsr >> 17) & 0x7
    }

    /// 4 フィールドをビット位置へ配置したエンコーディング
    pub fn encoding(crn: u32, op1: u32, crm: u32, op2: u32) -> u32 {
        ((crm & 0xf) << 1) | ((crn & 0xf) << 10) | ((op1 & 0x7) << 14) | ((op2 & 0x7) << 17)
    }

    /// シンドロームからエンコーディング部分だけを取り出す
    pub fn mask_encoding(hsr: u32) -> u32 {
        encoding(crn(hsr), op1(hsr), crm(hsr), op2(hsr))
    }
}

/// CP15 レジスタを裏付ける状態フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateField {
    Midr,
    Mpidr,
    Ctr,
    Ccsidr,
    Clidr,
    Pfr0,
    Mmfr0,
    Isar0,
    Isar3,
    Isar4,
    Csselr,
    Sctrl,
    Actrl,
    Cpacr,
    Ttbr0,
    Ttbr1,
    Ttbcr,
    Dacr,
    Dfsr,
    Ifsr,
    Adfsr,
    Aifsr,
    Dfar,
    Ifar,
    Prrr,
    Nmrr,
    Cidr,
}

impl StateField {
    fn read(self, state: &CpuState) -> u32 {
        match self {
            StateField::Midr => state.midr,
            StateField::Mpidr => state.mpidr,
            StateField::Ctr => state.ctr,
            StateField::Ccsidr => state.ccsidr,
            StateField::Clidr => state.clidr,
            StateField::Pfr0 => state.pfr0,
            StateField::Mmfr0 => state.mmfr0,
            StateField::Isar0 => state.isar0,
            StateField::Isar3 => state.isar3,
            StateField::Isar4 => state.isar4,
            StateField::Csselr => state.csselr,
            StateField::Sctrl => state.sctrl,
            StateField::Actrl => state.actrl,
            StateField::Cpacr => state.cpacr,
            StateField::Ttbr0 => state.ttbr0,
            StateField::Ttbr1 => state.ttbr1,
            StateField::Ttbcr => state.ttbcr,
            StateField::Dacr => state.dacr,
            StateField::Dfsr => state.dfsr,
            StateField::Ifsr => state.ifsr,
            StateField::Adfsr => state.adfsr,
            StateField::Aifsr => state.aifsr,
            StateField::Dfar => state.dfar,
            StateField::Ifar => state.ifar,
            StateField::Prrr => state.prrr,
            StateField::Nmrr => state.nmrr,
            StateField::Cidr => state.cidr,
        }
    }

    fn write(self, state: &mut CpuState, value: u32) {
        match self {
            StateField::Midr => state.midr = value,
            StateField::Mpidr => state.mpidr = value,
            StateField::Ctr => state.ctr = value,
            StateField::Ccsidr => state.ccsidr = value,
            StateField::Clidr => state.clidr = value,
            StateField::Pfr0 => state.pfr0 = value,
            StateField::Mmfr0 => state.mmfr0 = value,
            StateField::Isar0 => state.isar0 = value,
            StateField::Isar3 => state.isar3 = value,
            StateField::Isar4 => state.isar4 = value,
            StateField::Csselr => state.csselr = value,
            StateField::Sctrl => state.sctrl = value,
            StateField::Actrl => state.actrl = value,
            StateField::Cpacr => state.cpacr = value,
            StateField::Ttbr0 => state.ttbr0 = value,
            StateField::Ttbr1 => state.ttbr1 = value,
            StateField::Ttbcr => state.ttbcr = value,
            StateField::Dacr => state.dacr = value,
            StateField::Dfsr => state.dfsr = value,
            StateField::Ifsr => state.ifsr = value,
            StateField::Adfsr => state.adfsr = value,
            StateField::Aifsr => state.aifsr = value,
            StateField::Dfar => state.dfar = value,
            StateField::Ifar => state.ifar = value,
            StateField::Prrr => state.prrr = value,
            StateField::Nmrr => state.nmrr = value,
            StateField::Cidr => state.cidr = value,
        }
    }
}

/// レジスタ記述子: (crn, op1, crm, op2, 名前, 書き込み可否, フィールド, リセット値)
type RegDesc = (u32, u32, u32, u32, &'static str, bool, StateField, u32);

/// Cortex-A15 相当のレジスタテーブル
const REGISTERS: [RegDesc; 27] = [
    (0, 0, 0, 0, "MIDR", false, StateField::Midr, 0x412f_c0f1),
    (0, 0, 0, 5, "MPIDR", false, StateField::Mpidr, 0x4000_0000),
    (0, 0, 0, 1, "CTR", false, StateField::Ctr, 0x8444_c004),
    (0, 1, 0, 0, "CCSIDR", false, StateField::Ccsidr, 0x701f_e00a),
    (0, 1, 0, 1, "CLIDR", false, StateField::Clidr, 0x0a20_0023),
    (0, 0, 1, 0, "PFR0", false, StateField::Pfr0, 0x0000_1031),
    (0, 0, 1, 4, "MMFR0", false, StateField::Mmfr0, 0x1020_1105),
    (0, 0, 2, 0, "ISAR0", false, StateField::Isar0, 0x0210_1110),
    (0, 0, 2, 3, "ISAR3", false, StateField::Isar3, 0x1111_2131),
    (0, 0, 2, 4, "ISAR4", false, StateField::Isar4, 0x1001_1142),
    (0, 2, 0, 0, "CSSELR", true, StateField::Csselr, 0),
    (1, 0, 0, 0, "SCTRL", true, StateField::Sctrl, 0),
    (1, 0, 0, 1, "ACTRL", true, StateField::Actrl, 0x0000_0040),
    (1, 0, 0, 2, "CPACR", true, StateField::Cpacr, 0),
    (2, 0, 0, 0, "TTBR0", true, StateField::Ttbr0, 0),
    (2, 0, 0, 1, "TTBR1", true, StateField::Ttbr1, 0),
    (2, 0, 0, 2, "TTBCR", true, StateField::Ttbcr, 0),
    (3, 0, 0, 0, "DACR", true, StateField::Dacr, 0x5555_5555),
    (5, 0, 0, 0, "DFSR", true, StateField::Dfsr, 0),
    (5, 0, 0, 1, "IFSR", true, StateField::Ifsr, 0),
    (5, 0, 1, 0, "ADFSR", true, StateField::Adfsr, 0),
    (5, 0, 1, 1, "AIFSR", true, StateField::Aifsr, 0),
    (6, 0, 0, 0, "DFAR", true, StateField::Dfar, 0),
    (6, 0, 0, 2, "IFAR", true, StateField::Ifar, 0),
    (10, 0, 2, 0, "PRRR", true, StateField::Prrr, 0x0009_8aa4),
    (10, 0, 2, 1, "NMRR", true, StateField::Nmrr, 0x44e0_48e0),
    (13, 0, 0, 1, "CONTEXTIDR", true, StateField::Cidr, 0),
];

struct Register {
    name: &'static str,
    writeable: bool,
    field: StateField,
}

/// CP15 レジスタファイル
pub struct Cp15 {
    regs: BTreeMap<u32, Register>,
}

impl Cp15 {
    /// レジスタを登録し、リセット値を状態へ書き込む
    pub fn new(state: &mut CpuState) -> Self {
        let mut regs = BTreeMap::new();
        for (crn, op1, crm, op2, name, writeable, field, reset) in REGISTERS {
            field.write(state, reset);
            let prev = regs.insert(
                iss::encoding(crn, op1, crm, op2),
                Register {
                    name,
                    writeable,
                    field,
                },
            );
            // エンコーディングは互いに異なる
            debug_assert!(prev.is_none(), "duplicate cp15 encoding for {name}");
        }
        Self { regs }
    }

    /// CP15 トラップを処理する
    ///
    /// PC は進めない。呼び出し側が成功時に進める。
    pub fn handle_trap(&self, state: &mut CpuState) -> Result<(), VmmError> {
        let hsr = state.hsr;
        let reg = self
            .regs
            .get(&iss::mask_encoding(hsr))
            .ok_or(VmmError::UnknownCp15 {
                crn: iss::crn(hsr),
                op1: iss::op1(hsr),
                crm: iss::crm(hsr),
                op2: iss::op2(hsr),
            })?;

        let idx = iss::reg(hsr);
        if iss::is_read(hsr) {
            let value = reg.field.read(state);
            state.set_r(idx, value);
        } else {
            if !reg.writeable {
                return Err(VmmError::Cp15WriteProtected(reg.name));
            }
            let value = state.r(idx);
            reg.field.write(state, value);
        }
        Ok(())
    }
}
