//! Runtime controller discovery.
//!
//! Scans PCI sysfs for Fusion-MPT SAS2/SAS3 controllers. Which kernel
//! driver owns each one decides whether it can be opened through VFIO.

use crate::error::{MptError, Result};
use crate::vfio::VfioDevice;
use mpt_chip::pcie::{ChipVariant, ALL_DEVICE_IDS, LSI_VENDOR_ID};
use std::path::{Path, PathBuf};

/// Default sysfs directory holding one entry per PCI function.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Controllers found on the system.
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

/// One discovered controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in PCIe address order.
    pub index: usize,

    /// PCIe bus address (0000:03:00.0, etc.)
    pub pcie_address: String,

    /// PCI device ID.
    pub device_id: u16,

    /// Controller generation.
    pub variant: ChipVariant,

    /// Bound kernel driver, if any (`mpt3sas`, `vfio-pci`).
    pub driver: Option<String>,

    /// IOMMU group, if the IOMMU is enabled.
    pub iommu_group: Option<u32>,
}

impl DeviceManager {
    /// Discover every controller under [`SYSFS_PCI_DEVICES`].
    ///
    /// # Errors
    ///
    /// Returns [`MptError::NoDevicesFound`] if none are present.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(SYSFS_PCI_DEVICES))
    }

    /// Discover controllers under an arbitrary sysfs-shaped directory.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::DeviceNotFound`] if `root` cannot be read and
    /// [`MptError::NoDevicesFound`] if it holds no controller.
    pub fn discover_in(root: &Path) -> Result<Self> {
        tracing::info!("Discovering Fusion-MPT controllers in {}", root.display());

        let entries = std::fs::read_dir(root).map_err(|_| MptError::device_not_found(root))?;

        let mut found: Vec<(String, PathBuf, u16)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let vendor = read_hex_sysfs(&path.join("vendor")).ok()?;
                let device = read_hex_sysfs(&path.join("device")).ok()?;
                (vendor == LSI_VENDOR_ID && ALL_DEVICE_IDS.contains(&device)).then(|| {
                    (entry.file_name().to_string_lossy().to_string(), path, device)
                })
            })
            .collect();
        found.sort();

        let devices: Vec<DeviceInfo> = found
            .into_iter()
            .enumerate()
            .map(|(index, (pcie_address, path, device_id))| {
                let info = DeviceInfo {
                    index,
                    variant: ChipVariant::from_device_id(device_id),
                    driver: link_name(&path.join("driver")),
                    iommu_group: link_name(&path.join("iommu_group")).and_then(|g| g.parse().ok()),
                    pcie_address,
                    device_id,
                };
                tracing::info!(
                    "Controller {}: {:?} @ {} (driver {})",
                    info.index,
                    info.variant,
                    info.pcie_address,
                    info.driver.as_deref().unwrap_or("none")
                );
                info
            })
            .collect();

        if devices.is_empty() {
            tracing::warn!("No Fusion-MPT controllers found");
            return Err(MptError::NoDevicesFound);
        }
        tracing::info!("Discovered {} controller(s)", devices.len());
        Ok(Self { devices })
    }

    /// Number of controllers.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All controllers in PCIe address order.
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Controller by index.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::InvalidIndex`] if the index is out of bounds.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices.get(index).ok_or(MptError::InvalidIndex {
            index,
            count: self.devices.len(),
        })
    }

    /// Controller by PCIe address.
    pub fn by_address(&self, pcie_address: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.pcie_address == pcie_address)
    }

    /// Open a controller through VFIO.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::InvalidState`] if the controller is not bound to
    /// `vfio-pci`, or any error from [`VfioDevice::open`].
    pub fn open(&self, index: usize) -> Result<VfioDevice> {
        let info = self.device(index)?;
        if !info.is_vfio_bound() {
            return Err(MptError::invalid_state(format!(
                "{} is bound to {}, not vfio-pci",
                info.pcie_address,
                info.driver.as_deref().unwrap_or("no driver")
            )));
        }
        VfioDevice::open(&info.pcie_address)
    }
}

impl DeviceInfo {
    /// Whether `vfio-pci` owns the controller.
    #[must_use]
    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some("vfio-pci")
    }
}

fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MptError::hardware_error(format!("Cannot read {}: {e}", path.display())))?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16)
        .map_err(|e| MptError::hardware_error(format!("Invalid hex value: {e}")))
}

fn link_name(path: &Path) -> Option<String> {
    std::fs::read_link(path)
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FakeSysfs(PathBuf);

    impl FakeSysfs {
        fn new(name: &str) -> Self {
            let root = std::env::temp_dir().join(format!("mpt-sysfs-{name}-{}", std::process::id()));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(&root).unwrap();
            Self(root)
        }

        fn add(&self, addr: &str, vendor: u16, device: u16) -> PathBuf {
            let dir = self.0.join(addr);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vendor"), format!("0x{vendor:04x}\n")).unwrap();
            fs::write(dir.join("device"), format!("0x{device:04x}\n")).unwrap();
            dir
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn finds_controllers_in_address_order() {
        let sys = FakeSysfs::new("order");
        sys.add("0000:81:00.0", LSI_VENDOR_ID, 0x0097);
        sys.add("0000:03:00.0", LSI_VENDOR_ID, 0x0087);
        sys.add("0000:00:1f.2", 0x8086, 0x2822);
        sys.add("0000:04:00.0", LSI_VENDOR_ID, 0x0001);

        let mgr = DeviceManager::discover_in(&sys.0).unwrap();
        assert_eq!(mgr.device_count(), 2);
        let first = mgr.device(0).unwrap();
        assert_eq!(first.pcie_address, "0000:03:00.0");
        assert_eq!(first.variant, ChipVariant::Sas2(0x0087));
        assert_eq!(first.driver, None);
        assert_eq!(mgr.device(1).unwrap().variant, ChipVariant::Sas3(0x0097));
        assert!(mgr.by_address("0000:81:00.0").is_some());
        assert!(matches!(
            mgr.device(2),
            Err(MptError::InvalidIndex { index: 2, count: 2 })
        ));
    }

    #[test]
    fn reads_driver_and_group_links() {
        let sys = FakeSysfs::new("links");
        let dir = sys.add("0000:03:00.0", LSI_VENDOR_ID, 0x0097);
        std::os::unix::fs::symlink("../../../kernel/iommu_groups/17", dir.join("iommu_group"))
            .unwrap();
        std::os::unix::fs::symlink("../../../bus/pci/drivers/vfio-pci", dir.join("driver"))
            .unwrap();

        let mgr = DeviceManager::discover_in(&sys.0).unwrap();
        let info = mgr.device(0).unwrap();
        assert_eq!(info.iommu_group, Some(17));
        assert!(info.is_vfio_bound());
    }

    #[test]
    fn refuses_to_open_kernel_owned_controller() {
        let sys = FakeSysfs::new("owned");
        let dir = sys.add("0000:03:00.0", LSI_VENDOR_ID, 0x0097);
        std::os::unix::fs::symlink("../../../bus/pci/drivers/mpt3sas", dir.join("driver"))
            .unwrap();

        let mgr = DeviceManager::discover_in(&sys.0).unwrap();
        assert!(matches!(mgr.open(0), Err(MptError::InvalidState { .. })));
    }

    #[test]
    fn empty_tree_reports_no_devices() {
        let sys = FakeSysfs::new("empty");
        assert!(matches!(
            DeviceManager::discover_in(&sys.0),
            Err(MptError::NoDevicesFound)
        ));
    }
}
