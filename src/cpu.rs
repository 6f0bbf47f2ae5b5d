//! ゲスト CPU 状態 (ARMv7)
//!
//! VCPU サービスと共有されるアーキテクチャレジスタのレイアウトを定義します。
//! 1 回の VM Exit をまたいで見えるすべてのレジスタに加えて、仮想 GIC の
//! リストレジスタビューと仮想タイマービュー、CP15 のミラーフィールドを含みます。

use log::error;

/// GICH リストレジスタの本数
pub const NR_LIST_REGS: usize = 4;
/// バンクレジスタを持つモード数 (FIQ/IRQ/SVC/ABT/UND)
pub const NR_BANKED_MODES: usize = 5;

/// CPSR のモードフィールド
pub mod psr {
    pub const MODE_MASK: u32 = 0x1f;

    pub const USR: u32 = 16;
    pub const FIQ: u32 = 17;
    pub const IRQ: u32 = 18;
    pub const SVC: u32 = 19;
    pub const ABT: u32 = 23;
    pub const UND: u32 = 27;
    pub const SYS: u32 = 31;

    /// モードからバンクインデックスへ (FIQ→0, IRQ→1, SVC→2, ABT→3, UND→4)。
    /// USR/SYS およびその他のモードはバンクされない。
    pub fn mode_index(cpsr: u32) -> Option<usize> {
        match cpsr & MODE_MASK {
            FIQ => Some(0),
            IRQ => Some(1),
            SVC => Some(2),
            ABT => Some(3),
            UND => Some(4),
            _ => None,
        }
    }
}

/// HSR (Hyp Syndrome Register) の例外クラスフィールド
pub mod hsr {
    pub const EC_WFI: u32 = 0x01;
    pub const EC_CP15: u32 = 0x03;
    pub const EC_HVC: u32 = 0x12;
    pub const EC_DA: u32 = 0x24;

    pub fn ec(hsr: u32) -> u32 {
        (hsr >> 26) & 0x3f
    }
}

/// VM Exit の原因 (ホスト ABI の cpu_exception 値)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Exception {
    Reset = 1,
    Undefined = 2,
    Svc = 3,
    PfAbort = 4,
    DataAbort = 5,
    Irq = 6,
    Fiq = 7,
    Trap = 8,
}

impl Exception {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(Exception::Reset),
            2 => Some(Exception::Undefined),
            3 => Some(Exception::Svc),
            4 => Some(Exception::PfAbort),
            5 => Some(Exception::DataAbort),
            6 => Some(Exception::Irq),
            7 => Some(Exception::Fiq),
            8 => Some(Exception::Trap),
            _ => None,
        }
    }

    pub fn name(value: u32) -> &'static str {
        match value {
            0 => "nope",
            1 => "reset",
            2 => "undefined",
            3 => "svc",
            4 => "pf_abort",
            5 => "data_abort",
            6 => "irq",
            7 => "fiq",
            8 => "trap",
            _ => "unknown",
        }
    }
}

/// モード毎のバンクレジスタ
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeState {
    pub sp: u32,
    pub lr: u32,
    pub spsr: u32,
}

/// VCPU サービスと共有される CPU 状態ブロック
///
/// レイアウトはホストとの ABI。VCPU が停止している間だけ VMM が所有する。
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct CpuState {
    /// 汎用レジスタ r0..r12
    pub gpr: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    /// プログラムカウンタ
    pub ip: u32,
    pub cpsr: u32,
    /// VM Exit の原因 ([`Exception`] の raw 値)
    pub cpu_exception: u32,
    /// バンクレジスタ (FIQ/IRQ/SVC/ABT/UND)
    pub mode: [ModeState; NR_BANKED_MODES],

    /* トラップシンドローム */
    pub hsr: u32,
    pub hpfar: u32,
    pub hdfar: u32,

    /* 仮想 GIC (GICH) ビュー */
    pub gic_hcr: u32,
    pub gic_vmcr: u32,
    pub gic_misr: u32,
    pub gic_apr: u32,
    pub gic_eisr: u32,
    pub gic_elrsr0: u32,
    pub gic_lr: [u32; NR_LIST_REGS],
    /// IRQ Exit の原因となったホスト割り込み番号
    pub gic_irq: u32,

    /* 仮想タイマー (CNTV) ビュー */
    pub timer_ctrl: u32,
    pub timer_val: u32,
    pub timer_irq: bool,

    /* CP15 ミラー */
    pub midr: u32,
    pub mpidr: u32,
    pub ctr: u32,
    pub ccsidr: u32,
    pub clidr: u32,
    pub pfr0: u32,
    pub mmfr0: u32,
    pub isar0: u32,
    pub isar3: u32,
    pub isar4: u32,
    pub csselr: u32,
    pub sctrl: u32,
    pub actrl: u32,
    pub cpacr: u32,
    pub ttbr0: u32,
    pub ttbr1: u32,
    pub ttbcr: u32,
    pub dacr: u32,
    pub dfsr: u32,
    pub ifsr: u32,
    pub adfsr: u32,
    pub aifsr: u32,
    pub dfar: u32,
    pub ifar: u32,
    pub prrr: u32,
    pub nmrr: u32,
    pub cidr: u32,
}

impl CpuState {
    /// 論理レジスタ r(i) を読む
    ///
    /// i∈{13,14} は現在の CPSR モードのバンクスロットを参照する。
    /// インデックスはシンドロームの 4 ビットフィールドなので 0..15。
    pub fn r(&self, idx: usize) -> u32 {
        match idx & 0xf {
            i @ 0..=12 => self.gpr[i],
            13 => match psr::mode_index(self.cpsr) {
                Some(m) => self.mode[m].sp,
                None => self.sp,
            },
            14 => match psr::mode_index(self.cpsr) {
                Some(m) => self.mode[m].lr,
                None => self.lr,
            },
            _ => self.ip,
        }
    }

    /// 論理レジスタ r(i) へ書く
    pub fn set_r(&mut self, idx: usize, value: u32) {
        match idx & 0xf {
            i @ 0..=12 => self.gpr[i] = value,
            13 => match psr::mode_index(self.cpsr) {
                Some(m) => self.mode[m].sp = value,
                None => self.sp = value,
            },
            14 => match psr::mode_index(self.cpsr) {
                Some(m) => self.mode[m].lr = value,
                None => self.lr = value,
            },
            _ => self.ip = value,
        }
    }

    /// 汎用レジスタファイルとバンクレジスタを初期状態へ戻す
    ///
    /// CP15 ミラーと GIC/タイマービューには触れない。
    pub fn reset_regs(&mut self) {
        self.gpr = [0; 13];
        self.sp = 0;
        self.lr = 0;
        self.ip = 0;
        self.cpsr = 0;
        self.cpu_exception = 0;
        self.mode = [ModeState::default(); NR_BANKED_MODES];
    }

    /// CPU 状態全体をログへダンプする (ディスパッチ失敗時)
    pub fn dump(&self) {
        const MODES: [&str; NR_BANKED_MODES] = ["fiq", "irq", "svc", "abt", "und"];

        error!("Cpu state:");
        for (i, v) in self.gpr.iter().enumerate() {
            error!("  r{:<2}        = {:#010x}", i, v);
        }
        error!("  sp         = {:#010x}", self.sp);
        error!("  lr         = {:#010x}", self.lr);
        error!("  ip         = {:#010x}", self.ip);
        error!("  cpsr       = {:#010x}", self.cpsr);
        for (i, mode) in self.mode.iter().enumerate() {
            error!("  sp_{}     = {:#010x}", MODES[i], mode.sp);
            error!("  lr_{}     = {:#010x}", MODES[i], mode.lr);
            error!("  spsr_{}   = {:#010x}", MODES[i], mode.spsr);
        }
        error!("  exception  = {}", Exception::name(self.cpu_exception));
    }
}
