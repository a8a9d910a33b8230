//! Device-tree discovery of SDHCI controllers.

use fdt_parser::Fdt;
use log::{debug, info};

/// Compatible strings of the SDHCI blocks this driver has been run on.
pub const SDHCI_COMPATIBLE: &[&str] = &[
    "faraday,ftsdc021",
    "snps,dwcmshc-sdhci",
    "rockchip,dwcmshc-sdhci",
    "arasan,sdhci-8.9a",
];

/// Register window of a controller, as described by its `reg` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdhciWindow {
    pub address: u64,
    pub size: usize,
}

pub fn find_sdhci(fdt: &Fdt) -> Option<SdhciWindow> {
    find_sdhci_compatible(fdt, SDHCI_COMPATIBLE)
}

pub fn find_sdhci_compatible(fdt: &Fdt, compatible: &[&str]) -> Option<SdhciWindow> {
    let node = fdt.find_compatible(compatible).next()?;
    let reg = node.reg()?.next()?;

    let window = SdhciWindow {
        address: reg.address as u64,
        size: reg.size.unwrap_or(0x1000) as usize,
    };
    info!("SDHCI node {} at {:#x}", node.name, window.address);
    debug!("SDHCI window {:?}", window);

    Some(window)
}
