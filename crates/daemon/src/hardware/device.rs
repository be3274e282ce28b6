//! Hardware device records and the immutable catalog built at discovery

use crate::config::HardwareKind;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Codecs the software encoder path always handles
pub const CPU_CODECS: &[&str] = &["h264", "h265", "vp9", "mpeg2"];

/// One encoder backend found on the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareDevice {
    pub kind: HardwareKind,
    /// Render node path or GPU UUID; empty for CPU
    pub device_path: String,
    /// Index among devices of the same kind
    pub device_index: u32,
    pub display_name: String,
    pub capabilities: BTreeSet<String>,
    pub available: bool,
}

impl HardwareDevice {
    /// The software encoding entry present in every catalog
    pub fn cpu() -> Self {
        Self {
            kind: HardwareKind::Cpu,
            device_path: String::new(),
            device_index: 0,
            display_name: "CPU (Software Encoding)".to_string(),
            capabilities: CPU_CODECS.iter().map(|c| c.to_string()).collect(),
            available: true,
        }
    }

    pub fn new<I, S>(kind: HardwareKind, index: u32, path: &str, name: &str, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            device_path: path.to_string(),
            device_index: index,
            display_name: name.to_string(),
            capabilities: codecs.into_iter().map(Into::into).collect(),
            available: true,
        }
    }

    pub fn supports(&self, codec: &str) -> bool {
        self.capabilities.contains(codec)
    }

    /// `kind:index`, matching the hardware selector syntax
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind, self.device_index)
    }
}

/// Read-only snapshot of discovered devices, cheap to clone across sessions
#[derive(Debug, Clone)]
pub struct HardwareCatalog {
    devices: Arc<[HardwareDevice]>,
}

impl HardwareCatalog {
    pub fn new(devices: Vec<HardwareDevice>) -> Self {
        Self {
            devices: devices.into(),
        }
    }

    /// Catalog holding only the CPU entry
    pub fn cpu_only() -> Self {
        Self::new(vec![HardwareDevice::cpu()])
    }

    pub fn devices(&self) -> &[HardwareDevice] {
        &self.devices
    }

    pub fn iter(&self) -> impl Iterator<Item = &HardwareDevice> {
        self.devices.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn find(&self, kind: HardwareKind, index: u32) -> Option<&HardwareDevice> {
        self.iter()
            .find(|d| d.kind == kind && d.device_index == index)
    }

    pub fn first_available(&self, kind: HardwareKind) -> Option<&HardwareDevice> {
        self.iter().find(|d| d.kind == kind && d.available)
    }

    pub fn count_of(&self, kind: HardwareKind) -> usize {
        self.iter().filter(|d| d.kind == kind).count()
    }

    /// Log every device with its kind, index, name and capabilities
    pub fn log_devices(&self) {
        info!(count = self.len(), "Available hardware devices:");
        for device in self.iter() {
            info!(
                kind = %device.kind,
                index = device.device_index,
                name = %device.display_name,
                capabilities = ?device.capabilities,
                available = device.available,
                "  device"
            );
        }
    }
}

impl Serialize for HardwareCatalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.devices.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_entry_capabilities() {
        let cpu = HardwareDevice::cpu();
        assert_eq!(cpu.kind, HardwareKind::Cpu);
        assert!(cpu.available);
        for codec in CPU_CODECS {
            assert!(cpu.supports(codec));
        }
        assert_eq!(cpu.id(), "cpu:0");
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = HardwareCatalog::new(vec![
            HardwareDevice::cpu(),
            HardwareDevice::new(HardwareKind::Nvidia, 0, "GPU-aaa", "RTX A", ["h264"]),
            HardwareDevice::new(HardwareKind::Nvidia, 1, "GPU-bbb", "RTX B", ["h264", "h265"]),
        ]);

        assert_eq!(catalog.count_of(HardwareKind::Nvidia), 2);
        assert_eq!(catalog.find(HardwareKind::Nvidia, 1).unwrap().device_path, "GPU-bbb");
        assert!(catalog.find(HardwareKind::Intel, 0).is_none());
        assert_eq!(
            catalog.first_available(HardwareKind::Nvidia).unwrap().device_index,
            0
        );
    }

    #[test]
    fn test_catalog_serializes_as_list() {
        let json = serde_json::to_value(HardwareCatalog::cpu_only()).unwrap();
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["kind"], "cpu");
        assert_eq!(list[0]["capabilities"].as_array().unwrap().len(), 4);
    }
}
