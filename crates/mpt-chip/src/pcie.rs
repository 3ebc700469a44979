//! PCIe identifiers for the Fusion-MPT SAS2/SAS3 families.

/// LSI Logic / Broadcom vendor ID (PCI-SIG assigned).
pub const LSI_VENDOR_ID: u16 = 0x1000;

/// Memory BAR holding the MPI system register window.
///
/// BAR0 is the legacy I/O port window; the 64-bit memory window starts at
/// BAR1.
pub const REGISTER_BAR: u32 = 1;

/// Device IDs for the MPI 2 family.
pub mod device_id {
    /// SAS2004 (Spitfire).
    pub const SAS2004: u16 = 0x0070;
    /// SAS2008 (Falcon).
    pub const SAS2008: u16 = 0x0072;
    /// SAS2108 (Liberator).
    pub const SAS2108: u16 = 0x0074;
    /// SAS2116 (Meteor).
    pub const SAS2116: u16 = 0x0064;
    /// SAS2208 (Thunderbolt).
    pub const SAS2208: u16 = 0x0080;
    /// SAS2308 (Mustang), first ID.
    pub const SAS2308_1: u16 = 0x0086;
    /// SAS2308 (Mustang), second ID.
    pub const SAS2308_2: u16 = 0x0087;
    /// SAS3004.
    pub const SAS3004: u16 = 0x0096;
    /// SAS3008 (Fury).
    pub const SAS3008: u16 = 0x0097;
    /// SAS3108, first ID.
    pub const SAS3108_1: u16 = 0x005D;
    /// SAS3108, second ID.
    pub const SAS3108_2: u16 = 0x005F;
}

/// All device IDs driven through the MPI 2 queue engine.
pub const ALL_DEVICE_IDS: &[u16] = &[
    device_id::SAS2004,
    device_id::SAS2008,
    device_id::SAS2108,
    device_id::SAS2116,
    device_id::SAS2208,
    device_id::SAS2308_1,
    device_id::SAS2308_2,
    device_id::SAS3004,
    device_id::SAS3008,
    device_id::SAS3108_1,
    device_id::SAS3108_2,
];

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{LSI_VENDOR_ID:04x}:")
}

/// Controller generation discovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    /// 6 Gb/s SAS2 parts (MPI 2.0).
    Sas2(u16),
    /// 12 Gb/s SAS3 parts (MPI 2.5).
    Sas3(u16),
    /// Unknown / future part.
    Unknown(u16),
}

impl ChipVariant {
    /// Identify the generation from a PCI device ID.
    #[must_use]
    pub const fn from_device_id(id: u16) -> Self {
        match id {
            device_id::SAS2004
            | device_id::SAS2008
            | device_id::SAS2108
            | device_id::SAS2116
            | device_id::SAS2208
            | device_id::SAS2308_1
            | device_id::SAS2308_2 => Self::Sas2(id),
            device_id::SAS3004
            | device_id::SAS3008
            | device_id::SAS3108_1
            | device_id::SAS3108_2 => Self::Sas3(id),
            other => Self::Unknown(other),
        }
    }

    /// Marketing name of the part.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sas2(device_id::SAS2004) => "SAS2004",
            Self::Sas2(device_id::SAS2008) => "SAS2008",
            Self::Sas2(device_id::SAS2108) => "SAS2108",
            Self::Sas2(device_id::SAS2116) => "SAS2116",
            Self::Sas2(device_id::SAS2208) => "SAS2208",
            Self::Sas2(_) => "SAS2308",
            Self::Sas3(device_id::SAS3004) => "SAS3004",
            Self::Sas3(device_id::SAS3008) => "SAS3008",
            Self::Sas3(_) => "SAS3108",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Link rate in Gb/s.
    #[must_use]
    pub const fn link_gbps(&self) -> u32 {
        match self {
            Self::Sas2(_) => 6,
            Self::Sas3(_) => 12,
            Self::Unknown(_) => 0,
        }
    }

    /// Whether the part speaks MPI 2.5 (IEEE SGLs in every message).
    #[must_use]
    pub const fn is_mpi25(&self) -> bool {
        matches!(self, Self::Sas3(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_id_is_known() {
        for &id in ALL_DEVICE_IDS {
            assert!(
                !matches!(ChipVariant::from_device_id(id), ChipVariant::Unknown(_)),
                "{id:#06x} should map to a variant"
            );
        }
    }

    #[test]
    fn variants_report_names() {
        assert_eq!(ChipVariant::from_device_id(0x0072).name(), "SAS2008");
        assert_eq!(ChipVariant::from_device_id(0x0097).name(), "SAS3008");
        assert_eq!(ChipVariant::from_device_id(0x0087).name(), "SAS2308");
        assert!(ChipVariant::from_device_id(0x0097).is_mpi25());
        assert_eq!(ChipVariant::from_device_id(0x1234), ChipVariant::Unknown(0x1234));
    }
}
