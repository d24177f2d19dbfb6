//! Apple SoC platform table.

/// A known Apple system-on-chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    /// Platform identifier as it appears in kernel build names (e.g. "T8030")
    pub platform: &'static str,
    /// Marketing name of the chip
    pub soc: &'static str,
}

const fn device(platform: &'static str, soc: &'static str) -> Device {
    Device { platform, soc }
}

/// Known platforms. Identifiers are unique.
pub static DEVICES: &[Device] = &[
    device("S5L8960X", "A7"),
    device("T7000", "A8"),
    device("T7001", "A8X"),
    device("S8000", "A9"),
    device("S8003", "A9"),
    device("S8001", "A9X"),
    device("T8002", "S1/S2"),
    device("T8004", "S3"),
    device("T8010", "A10 Fusion"),
    device("T8011", "A10X Fusion"),
    device("T8012", "T2"),
    device("T8015", "A11 Bionic"),
    device("T8006", "S4/S5"),
    device("T8020", "A12 Bionic"),
    device("T8027", "A12X/Z Bionic"),
    device("T8030", "A13 Bionic"),
    device("T8301", "S6/S7"),
    device("T8101", "A14 Bionic"),
    device("T8103", "M1"),
    device("T6000", "M1 Pro"),
    device("T6001", "M1 Max"),
    device("T6002", "M1 Ultra"),
    device("T8110", "A15 Bionic"),
    device("T8310", "S8"),
    device("T8112", "M2"),
    device("T6020", "M2 Pro"),
    device("T6021", "M2 Max"),
    device("T6022", "M2 Ultra"),
    device("T8120", "A16 Bionic"),
    device("T8122", "M3"),
    device("T6030", "M3 Pro"),
    device("T6031", "M3 Max"),
    device("T6034", "M3 Max"),
    device("T8130", "A17 Pro"),
    device("T8132", "M4"),
    device("T8140", "A18"),
    device("VMAPPLE", "Virtual Machine"),
];

/// Looks up a platform identifier, ignoring ASCII case.
pub fn lookup_device(platform: &str) -> Option<&'static Device> {
    DEVICES
        .iter()
        .find(|d| d.platform.eq_ignore_ascii_case(platform))
}

/// Formats a platform identifier as "<chip> (<platform>)", or
/// "<platform> (Unknown)" when it is not in the table.
pub fn describe_device(platform: &str) -> String {
    match lookup_device(platform) {
        Some(d) => format!("{} ({})", d.soc, d.platform),
        None => format!("{} (Unknown)", platform),
    }
}
