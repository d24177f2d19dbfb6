//! Darwin firmware components.
//!
//! Classification is signature based: a kernelcache is a Mach-O with a
//! `__PRELINK_INFO` segment and a uname string, iBoot and SEP firmware are
//! recognized by marker strings embedded in their images.

mod devices;
mod kernel;
mod kext;
mod prelink;
mod traps;

pub use devices::*;
pub use kernel::*;
pub use kext::*;
pub use prelink::*;
pub use traps::*;

use std::fmt;

use tracing::debug;

use crate::macho::MachOImage;
use crate::util::contains;

const IBOOT_MARKERS: [&[u8]; 3] = [b"iBoot for", b"Apple Mobile Device", b"Apple Secure Boot"];
const SEP_MARKERS: [&[u8]; 3] = [b"Built by legion2", b"AppleSEPROM-", b"private_build.."];

/// Kind of Darwin firmware component.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    Kernel,
    Iboot,
    Sep,
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirmwareKind::Kernel => "XNU kernelcache",
            FirmwareKind::Iboot => "iBoot",
            FirmwareKind::Sep => "Secure Enclave firmware",
        })
    }
}

/// Returns true if `data` is a kernelcache.
pub fn is_kernel(data: &[u8]) -> bool {
    let Ok(image) = MachOImage::parse(data) else {
        return false;
    };
    let has_prelink = image.segment("__PRELINK_INFO").is_some()
        || image
            .fileset_image(KERNEL_ENTRY_ID)
            .is_ok_and(|kernel| kernel.segment("__PRELINK_INFO").is_some());
    has_prelink && contains(data, UNAME_MARKER)
}

/// Returns true if `data` carries all iBoot markers.
pub fn is_iboot(data: &[u8]) -> bool {
    IBOOT_MARKERS.iter().all(|m| contains(data, m))
}

/// Returns true if `data` carries any SEP marker.
pub fn is_sep(data: &[u8]) -> bool {
    SEP_MARKERS.iter().any(|m| contains(data, m))
}

/// Classifies a buffer as a Darwin firmware component.
pub fn resolve_firmware_kind(data: &[u8]) -> Option<FirmwareKind> {
    let kind = if is_kernel(data) {
        Some(FirmwareKind::Kernel)
    } else if is_iboot(data) {
        Some(FirmwareKind::Iboot)
    } else if is_sep(data) {
        Some(FirmwareKind::Sep)
    } else {
        None
    };
    debug!("firmware kind: {:?}", kind);
    kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::MH_EXECUTE;
    use crate::testutil::*;

    #[test]
    fn test_kernel_needs_prelink_and_uname() {
        let builder = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", 0xfffffff007004000, 0x1000, 0, 0x1000, &[])
            .segment("__PRELINK_INFO", 0xfffffff009000000, 0, 0, 0, &[]);
        let mut data = builder.build(0x1000);
        assert_eq!(resolve_firmware_kind(&data), None);

        put_bytes(&mut data, 0x800, b"Darwin Kernel Version 22.0.0: ...");
        assert_eq!(resolve_firmware_kind(&data), Some(FirmwareKind::Kernel));

        let mut plain = simple_arm64(0x1000);
        put_bytes(&mut plain, 0x800, b"Darwin Kernel Version 22.0.0: ...");
        assert_eq!(resolve_firmware_kind(&plain), None);
    }

    #[test]
    fn test_iboot_and_sep_markers() {
        let mut data = vec![0u8; 0x400];
        put_bytes(&mut data, 0x100, b"iBoot for d321, Copyright 2007-2022");
        put_bytes(&mut data, 0x200, b"Apple Mobile Device (DFU Mode)");
        assert_eq!(resolve_firmware_kind(&data), None);
        put_bytes(&mut data, 0x300, b"Apple Secure Boot");
        assert_eq!(resolve_firmware_kind(&data), Some(FirmwareKind::Iboot));

        let mut sep = vec![0u8; 0x100];
        put_bytes(&mut sep, 0x40, b"AppleSEPROM-1234");
        assert_eq!(resolve_firmware_kind(&sep), Some(FirmwareKind::Sep));
    }
}
