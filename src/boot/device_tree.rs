//! Device Tree (FDT) generation for ARMv7 Linux boot
//!
//! Builds a minimal VersaTile-Express-flavoured Device Tree matching the
//! emulated peripherals. Embedders that ship a prebuilt blob through the
//! "dtb" ROM do not need this; it exists for self-contained setups.

use vm_fdt::FdtWriter;

use crate::board;
use crate::error::VmmError;

/// GIC interrupt cell type
const IRQ_TYPE_SPI: u32 = 0;
const IRQ_TYPE_PPI: u32 = 1;
/// Level-low trigger flags (4 CPUs in the PPI mask field)
const IRQ_LEVEL_LOW: u32 = 0xf08;
const IRQ_SPI_LEVEL_HIGH: u32 = 0x4;

/// Device Tree configuration
#[derive(Debug, Clone)]
pub struct DeviceTreeConfig {
    /// Memory base address
    pub memory_base: u64,
    /// Memory size in bytes
    pub memory_size: u64,
    /// Kernel command line
    pub cmdline: String,
}

impl Default for DeviceTreeConfig {
    fn default() -> Self {
        Self {
            memory_base: board::RAM_BASE,
            memory_size: board::RAM_SIZE_DEFAULT as u64,
            cmdline: "console=ttyAMA0".to_string(),
        }
    }
}

/// Generate a Device Tree binary for ARMv7 Linux boot
///
/// Creates a minimal Device Tree with:
/// - CPU node (single Cortex-A15)
/// - Memory node
/// - GIC node (distributor + virtual CPU interface)
/// - ARMv7 generic timer PPIs
/// - UART (PL011) node
/// - VersaTile Express system registers
/// - chosen node with bootargs
pub fn generate_device_tree(config: &DeviceTreeConfig) -> Result<Vec<u8>, VmmError> {
    let mut fdt = FdtWriter::new().map_err(to_error)?;

    // Root node (32-bit cells)
    let root_node = fdt.begin_node("").map_err(to_error)?;
    fdt.property_string("compatible", "arm,vexpress")
        .map_err(to_error)?;
    fdt.property_u32("#address-cells", 1).map_err(to_error)?;
    fdt.property_u32("#size-cells", 1).map_err(to_error)?;
    fdt.property_u32("interrupt-parent", 1).map_err(to_error)?;
    fdt.property_string("model", "V2P-CA15").map_err(to_error)?;

    // CPUs node
    let cpus_node = fdt.begin_node("cpus").map_err(to_error)?;
    fdt.property_u32("#address-cells", 1).map_err(to_error)?;
    fdt.property_u32("#size-cells", 0).map_err(to_error)?;

    let cpu0_node = fdt.begin_node("cpu@0").map_err(to_error)?;
    fdt.property_string("device_type", "cpu").map_err(to_error)?;
    fdt.property_string("compatible", "arm,cortex-a15")
        .map_err(to_error)?;
    fdt.property_u32("reg", 0).map_err(to_error)?;
    fdt.end_node(cpu0_node).map_err(to_error)?;

    fdt.end_node(cpus_node).map_err(to_error)?;

    // Memory node
    let memory_node_name = format!("memory@{:x}", config.memory_base);
    let memory_node = fdt.begin_node(&memory_node_name).map_err(to_error)?;
    fdt.property_string("device_type", "memory")
        .map_err(to_error)?;
    fdt.property_array_u32(
        "reg",
        &[config.memory_base as u32, config.memory_size as u32],
    )
    .map_err(to_error)?;
    fdt.end_node(memory_node).map_err(to_error)?;

    // GIC node: distributor is emulated, the virtual CPU interface is the
    // hardware GICV the host attaches
    let gic_node_name = format!("interrupt-controller@{:x}", board::GICD_MMIO_BASE);
    let gic_node = fdt.begin_node(&gic_node_name).map_err(to_error)?;
    fdt.property_string("compatible", "arm,cortex-a15-gic")
        .map_err(to_error)?;
    fdt.property_u32("#interrupt-cells", 3).map_err(to_error)?;
    fdt.property_null("interrupt-controller")
        .map_err(to_error)?;
    fdt.property_array_u32(
        "reg",
        &[
            board::GICD_MMIO_BASE as u32,
            board::GICD_MMIO_SIZE as u32,
            board::GICC_MMIO_BASE as u32,
            0x2000,
        ],
    )
    .map_err(to_error)?;
    fdt.property_u32("phandle", 1).map_err(to_error)?;
    fdt.end_node(gic_node).map_err(to_error)?;

    // ARMv7 generic timer (virtual timer PPI 27 = 16 + 11)
    let timer_node = fdt.begin_node("timer").map_err(to_error)?;
    fdt.property_string("compatible", "arm,armv7-timer")
        .map_err(to_error)?;
    fdt.property_array_u32(
        "interrupts",
        &[
            IRQ_TYPE_PPI,
            13,
            IRQ_LEVEL_LOW,
            IRQ_TYPE_PPI,
            14,
            IRQ_LEVEL_LOW,
            IRQ_TYPE_PPI,
            11,
            IRQ_LEVEL_LOW,
            IRQ_TYPE_PPI,
            10,
            IRQ_LEVEL_LOW,
        ],
    )
    .map_err(to_error)?;
    fdt.end_node(timer_node).map_err(to_error)?;

    // UART node (PL011, SPI 5 = IRQ 37 - 32)
    let uart_node_name = format!("uart@{:x}", board::PL011_MMIO_BASE);
    let uart_node = fdt.begin_node(&uart_node_name).map_err(to_error)?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,pl011".to_string(), "arm,primecell".to_string()],
    )
    .map_err(to_error)?;
    fdt.property_array_u32(
        "reg",
        &[
            board::PL011_MMIO_BASE as u32,
            board::PL011_MMIO_SIZE as u32,
        ],
    )
    .map_err(to_error)?;
    fdt.property_array_u32(
        "interrupts",
        &[
            IRQ_TYPE_SPI,
            board::PL011_IRQ - 32,
            IRQ_SPI_LEVEL_HIGH,
        ],
    )
    .map_err(to_error)?;
    fdt.end_node(uart_node).map_err(to_error)?;

    // System registers
    let sysreg_node_name = format!("sysreg@{:x}", board::SYSREGS_MMIO_BASE);
    let sysreg_node = fdt.begin_node(&sysreg_node_name).map_err(to_error)?;
    fdt.property_string("compatible", "arm,vexpress-sysreg")
        .map_err(to_error)?;
    fdt.property_array_u32(
        "reg",
        &[
            board::SYSREGS_MMIO_BASE as u32,
            board::SYSREGS_MMIO_SIZE as u32,
        ],
    )
    .map_err(to_error)?;
    fdt.end_node(sysreg_node).map_err(to_error)?;

    // chosen node (boot parameters)
    let chosen_node = fdt.begin_node("chosen").map_err(to_error)?;
    fdt.property_string("bootargs", &config.cmdline)
        .map_err(to_error)?;
    fdt.property_string("stdout-path", &uart_node_name)
        .map_err(to_error)?;
    fdt.end_node(chosen_node).map_err(to_error)?;

    fdt.end_node(root_node).map_err(to_error)?;

    fdt.finish().map_err(to_error)
}

fn to_error(err: vm_fdt::Error) -> VmmError {
    VmmError::DeviceTree(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_device_tree_with_default_config() {
        let config = DeviceTreeConfig::default();
        let dtb = generate_device_tree(&config).unwrap();

        // DTB starts with the FDT magic number (0xd00dfeed)
        assert_eq!(dtb[0..4], [0xd0, 0x0d, 0xfe, 0xed]);
        assert!(dtb.len() > 100);
    }

    #[test]
    fn test_generate_device_tree_with_custom_config() {
        let config = DeviceTreeConfig {
            memory_base: board::RAM_BASE,
            memory_size: 0x1000_0000, // 256MB
            cmdline: "console=ttyAMA0 earlycon".to_string(),
        };

        let dtb = generate_device_tree(&config).unwrap();

        assert_eq!(dtb[0..4], [0xd0, 0x0d, 0xfe, 0xed]);
        assert!(dtb.len() > 100);
    }

    #[test]
    fn test_device_tree_config_default() {
        let config = DeviceTreeConfig::default();
        assert_eq!(config.memory_base, board::RAM_BASE);
        assert_eq!(config.memory_size, board::RAM_SIZE_DEFAULT as u64);
        assert_eq!(config.cmdline, "console=ttyAMA0");
    }

    #[test]
    fn test_device_tree_contains_bootargs() {
        let config = DeviceTreeConfig {
            cmdline: "root=/dev/ram earlyprintk".to_string(),
            ..DeviceTreeConfig::default()
        };
        let dtb = generate_device_tree(&config).unwrap();

        let needle = b"root=/dev/ram earlyprintk";
        assert!(dtb.windows(needle.len()).any(|w| w == needle));
    }
}
