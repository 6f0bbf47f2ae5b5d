//! ゲスト物理アドレスマップと割り込み番号 (VersaTile Express 互換)

/// ゲスト RAM のベースアドレス
pub const RAM_BASE: u64 = 0x8000_0000;
/// ゲスト RAM のデフォルトサイズ (128 MiB)
pub const RAM_SIZE_DEFAULT: usize = 128 * 1024 * 1024;
/// カーネルイメージの RAM 内オフセット
pub const KERNEL_OFFSET: u64 = 0x8000;
/// Device Tree Blob の RAM 内オフセット (64 MiB)
pub const DTB_OFFSET: u64 = 64 * 1024 * 1024;

/// machine type (VEXPRESS)
pub const MACH_TYPE: u32 = 2272;

/// エミュレートする GIC ディストリビュータ
pub const GICD_MMIO_BASE: u64 = 0x2c00_1000;
pub const GICD_MMIO_SIZE: u64 = 0x2000;
/// ハードウェア仮想 CPU インターフェース (ホストが attach する)
pub const GICC_MMIO_BASE: u64 = 0x2c00_2000;

/// エミュレートする Generic Timer
pub const TIMER_MMIO_BASE: u64 = 0x2a43_0000;
pub const TIMER_MMIO_SIZE: u64 = 0x1000;

/// エミュレートするシステムレジスタブロック
pub const SYSREGS_MMIO_BASE: u64 = 0x1c01_0000;
pub const SYSREGS_MMIO_SIZE: u64 = 0x1000;

/// エミュレートする PL011 UART
pub const PL011_MMIO_BASE: u64 = 0x1c09_0000;
pub const PL011_MMIO_SIZE: u64 = 0x1000;

/// GIC メンテナンス割り込み (PPI)
pub const VT_MAINTENANCE_IRQ: u32 = 25;
/// 仮想タイマー割り込み (PPI)
pub const VT_TIMER_IRQ: u32 = 27;
/// PL011 UART 割り込み (SPI)
pub const PL011_IRQ: u32 = 37;

/// ゲストタイマーの周波数 (MHz)。timer_val のティックをマイクロ秒へ変換する除数
pub const TIMER_TICKS_PER_US: u32 = 24;
