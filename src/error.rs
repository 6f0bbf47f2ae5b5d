//! VMM error taxonomy
//!
//! すべてのハンドラ失敗はこの型で表現され、現在のディスパッチを中断する。
//! ゲストへ同期例外として伝播することはない。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmmError {
    /* trap decoder */
    #[error("unknown hyper call")]
    UnknownHyperCall,
    #[error("unknown trap: EC={0:#x}")]
    UnknownTrap(u32),
    #[error("unexpected exception: {0}")]
    UnexpectedException(u32),
    #[error("WFE not implemented")]
    WfeNotImplemented,

    /* cp15 */
    #[error("unknown cp15 access: crn={crn} op1={op1} crm={crm} op2={op2}")]
    UnknownCp15 { crn: u32, op1: u32, crm: u32, op2: u32 },
    #[error("writing to cp15 register {0} not allowed")]
    Cp15WriteProtected(&'static str),

    /* MMIO path */
    #[error("no device at IPA {0:#x}")]
    NoDeviceAtIpa(u64),
    #[error("device {device}: unknown HSR {hsr:#x}")]
    MalformedHsr { device: &'static str, hsr: u32 },
    #[error("device {device}: {width}-bit access at offset {offset:#x} not allowed")]
    UnsupportedAccessWidth {
        device: &'static str,
        width: u32,
        offset: u64,
    },
    #[error("device {0}: invalid access alignment")]
    UnalignedAccess(&'static str),

    /* vGIC */
    #[error("GIC: unsupported offset {0:#x}")]
    UnsupportedGicOffset(u64),
    #[error("no device registered for IRQ {0}")]
    UnknownInjection(u32),
    #[error("pending IRQ {0} must not trigger again")]
    DoubleInject(u32),
    #[error("list registers full, can't inject IRQ {0}")]
    ListRegistersFull(u32),
    #[error("IRQ {0} out of bounds")]
    IrqOutOfBounds(u32),
    #[error("unexpected host IRQ {0}")]
    UnexpectedHostIrq(u32),

    /* system registers */
    #[error("sys regs: unsupported MCC device {device} func={function} write={write}")]
    UnsupportedMcc {
        device: u32,
        function: u32,
        write: bool,
    },

    /* per-device register files */
    #[error("device {device}: unsupported offset {offset:#x}")]
    UnsupportedOffset { device: &'static str, offset: u64 },

    /* construction / services */
    #[error("device {name}: region {base:#x}+{size:#x} overlaps an existing device")]
    DeviceOverlap {
        name: &'static str,
        base: u64,
        size: u64,
    },
    #[error("device {name}: region {base:#x}+{size:#x} is not page aligned")]
    UnalignedDevice {
        name: &'static str,
        base: u64,
        size: u64,
    },
    #[error("guest RAM access at offset {offset:#x} ({len} bytes) out of range")]
    RamOutOfRange { offset: u64, len: usize },
    #[error("ROM '{0}' not available")]
    RomMissing(String),
    #[error("device tree generation failed: {0}")]
    DeviceTree(String),
    #[error("poisoned lock: {0}")]
    LockPoisoned(&'static str),
}
