//! Kernel extension discovery.
//!
//! Each kernelcache era packs its KEXTs differently:
//!
//! - **Split** (iOS 9-11): a plist in `__PRELINK_INFO` gives every KEXT's
//!   load address, which is rebased through `__PRELINK_TEXT`.
//! - **Merged** (iOS 12-15): `__kmod_start` and `__kmod_info` hold parallel
//!   tables of tagged pointers to the KEXT headers and their `kmod_info`.
//! - **Fileset** (iOS 16+, Apple-silicon macOS): every KEXT is an
//!   `LC_FILESET_ENTRY` of the outer image.
//!
//! A [`KextRecord`] never borrows the kernel. It stores the location of the
//! KEXT, and [`KernelImage`](super::KernelImage) turns it back into bytes or
//! a [`MachOImage`] on request.

use tracing::{debug, warn};
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::prelink::PrelinkScanner;
use crate::error::{Error, ItemError, Result};
use crate::macho::{format_source_version, MachHeader32, MachHeader64, MachOImage, MH_MAGIC_64};
use crate::util::{checked_range, fixed_str, read_struct, ByteView};

/// Version reported for a KEXT without `LC_SOURCE_VERSION`.
const UNKNOWN_VERSION: &str = "0.0.0";

// =============================================================================
// Records
// =============================================================================

/// One kernel extension located inside a kernelcache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextRecord {
    /// Position in discovery order
    pub index: usize,
    /// Bundle identifier
    pub name: String,
    /// Bundle version
    pub version: String,
    /// Image UUID
    pub uuid: Option<Uuid>,
    /// Offset of the KEXT's Mach-O header in the kernel buffer
    pub offset: usize,
    /// Contiguous bytes starting at the header
    pub size: usize,
    /// Kernel address of the header, when the layout records one
    pub vmaddr: Option<u64>,
}

/// Result of a KEXT scan: the records that decoded and the entries that did
/// not.
#[derive(Debug, Default)]
pub struct KextList {
    /// Decoded KEXTs in discovery order
    pub kexts: Vec<KextRecord>,
    /// Entries that were skipped
    pub errors: Vec<ItemError>,
}

impl KextList {
    /// Finds a KEXT by bundle identifier.
    pub fn find(&self, name: &str) -> Option<&KextRecord> {
        self.kexts.iter().find(|k| k.name == name)
    }

    /// Number of decoded KEXTs.
    pub fn len(&self) -> usize {
        self.kexts.len()
    }

    /// Returns true if no KEXT decoded.
    pub fn is_empty(&self) -> bool {
        self.kexts.is_empty()
    }

    fn push(&mut self, index: usize, result: Result<KextRecord>) {
        match result {
            Ok(kext) => self.kexts.push(kext),
            Err(error) => {
                warn!("skipping KEXT entry {}: {}", index, error);
                self.errors.push(ItemError::new(index, error));
            }
        }
    }
}

/// Builds a record for the Mach-O header at `offset`. Name and version fall
/// back to what the image's load commands say.
fn record_at(
    data: &[u8],
    index: usize,
    offset: usize,
    name: String,
    version: Option<String>,
    vmaddr: Option<u64>,
) -> Result<KextRecord> {
    let image = MachOImage::parse_at(data, offset)?;
    let size = kext_extent(&image, offset)?;
    let version = version.unwrap_or_else(|| {
        image
            .source_version()
            .map(format_source_version)
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    });

    debug!("KEXT {} at {:#x} ({:#x} bytes)", name, offset, size);
    Ok(KextRecord {
        index,
        name,
        version,
        uuid: image.uuid(),
        offset,
        size,
        vmaddr,
    })
}

/// Returns the length of the contiguous file region that starts at the
/// KEXT's header: the load commands plus every segment that continues it
/// without a gap.
///
/// Segment file offsets are absolute when one of them points at the header
/// itself, and relative to the header otherwise.
pub fn kext_extent(image: &MachOImage<'_>, offset: usize) -> Result<usize> {
    let header_size = if image.is_64 {
        MachHeader64::SIZE
    } else {
        MachHeader32::SIZE
    };
    let origin = offset as u64;
    let base = if image.segments().any(|s| s.command.fileoff == origin) {
        0
    } else {
        origin
    };

    let mut ranges: Vec<(u64, u64)> = image
        .segments()
        .filter(|s| s.command.filesize > 0)
        .map(|s| {
            let start = base.saturating_add(s.command.fileoff);
            (start, start.saturating_add(s.command.filesize))
        })
        .filter(|&(start, _)| start >= origin)
        .collect();
    ranges.sort_unstable();

    let mut end = origin + (header_size + image.header.sizeofcmds as usize) as u64;
    for (start, stop) in ranges {
        if start > end {
            break;
        }
        end = end.max(stop);
    }

    let size = (end - origin) as usize;
    checked_range(image.data(), offset, size)?;
    Ok(size)
}

// =============================================================================
// Split Style
// =============================================================================

/// Scans the prelink plist of a split-style (or iOS 9) kernel.
pub(crate) fn split_style(kernel: &MachOImage<'_>) -> Result<KextList> {
    let xml = kernel.segment_data("__PRELINK_INFO")?;
    let text = &kernel.require_segment("__PRELINK_TEXT")?.command;
    let data = kernel.data();

    let mut list = KextList::default();
    for (index, entry) in PrelinkScanner::new(xml)?.enumerate() {
        let result = match entry.load_addr {
            Some(addr) => {
                let offset = addr.wrapping_sub(text.vmaddr).wrapping_add(text.fileoff);
                usize::try_from(offset)
                    .map_err(|_| Error::out_of_bounds(offset, 0, data.len()))
                    .and_then(|offset| {
                        record_at(data, index, offset, entry.bundle_id, None, Some(addr))
                    })
            }
            None => Err(Error::parse(
                entry.offset,
                format!(
                    "cannot parse load address '{}' of {}",
                    entry.load_addr_text, entry.bundle_id
                ),
            )),
        };
        list.push(index, result);
    }

    debug!("split-style scan found {} KEXTs", list.len());
    Ok(list)
}

// =============================================================================
// Merged Style
// =============================================================================

/// Leading part of `kmod_info_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct KmodInfo {
    /// Next entry in the kernel's list
    pub next_addr: u64,
    /// Structure version
    pub info_version: i32,
    /// Load identifier
    pub id: u32,
    /// Bundle identifier, NUL padded
    pub name: [u8; 64],
    /// Bundle version, NUL padded
    pub version: [u8; 64],
}

/// Sets the 16 tag bits of a kernel pointer.
#[inline]
pub fn untag_ptr(ptr: u64) -> u64 {
    ptr | 0xffff_0000_0000_0000
}

/// Converts a `__kmod_start` entry into a file offset.
///
/// The entry is rebased against `__TEXT` and folded into the low 32 bits the
/// way observed iOS 12-15 kernels lay out their KEXT headers. The mapping is
/// not guaranteed for every build, so callers check for a Mach-O magic at
/// the result.
#[inline]
pub fn merged_kext_offset(kext_ptr: u64, text_vmaddr: u64) -> u64 {
    let kernel_ptr = untag_ptr(kext_ptr.wrapping_sub(text_vmaddr)) | 0xffff_ffff_f000_0000;
    kernel_ptr.wrapping_sub(0xf000_0000) & 0xffff_ffff
}

/// Walks the `__kmod_start`/`__kmod_info` tables of a merged-style kernel.
pub(crate) fn merged_style(kernel: &MachOImage<'_>) -> Result<KextList> {
    let text_vmaddr = kernel.require_segment("__TEXT")?.command.vmaddr;
    let starts = ByteView::new(kernel.section_data("__PRELINK_INFO", "__kmod_start")?);
    let infos = ByteView::new(kernel.section_data("__PRELINK_INFO", "__kmod_info")?);
    let data = kernel.data();

    let count = starts.len().min(infos.len()) / 8;
    let mut list = KextList::default();
    for index in 0..count {
        let result = starts.u64_le(index * 8).and_then(|kext_ptr| {
            let info_ptr = infos.u64_le(index * 8)?;
            merged_entry(data, index, text_vmaddr, kext_ptr, info_ptr)
        });
        list.push(index, result);
    }

    debug!("merged-style scan found {} of {} KEXTs", list.len(), count);
    Ok(list)
}

fn merged_entry(
    data: &[u8],
    index: usize,
    text_vmaddr: u64,
    kext_ptr: u64,
    info_ptr: u64,
) -> Result<KextRecord> {
    let offset = merged_kext_offset(kext_ptr, text_vmaddr) as usize;
    let magic = ByteView::new(data).u32_le(offset)?;
    if magic != MH_MAGIC_64 {
        return Err(Error::parse(
            offset,
            format!(
                "kmod_start entry {:#x} does not point at a Mach-O header (found {:#010x})",
                kext_ptr, magic
            ),
        ));
    }

    let kmod_offset = untag_ptr(info_ptr).wrapping_sub(text_vmaddr);
    let kmod_offset = usize::try_from(kmod_offset)
        .map_err(|_| Error::out_of_bounds(kmod_offset, 0, data.len()))?;
    let kmod: KmodInfo = read_struct(data, kmod_offset)?;

    record_at(
        data,
        index,
        offset,
        fixed_str(&kmod.name),
        Some(fixed_str(&kmod.version)),
        Some(untag_ptr(kext_ptr)),
    )
}

// =============================================================================
// Fileset Style
// =============================================================================

/// Lists the entries of an `MH_FILESET` kernelcache.
pub(crate) fn fileset_style(outer: &MachOImage<'_>) -> Result<KextList> {
    let data = outer.data();
    if outer.fileset_entries().next().is_none() {
        return Err(Error::LoadCommandNotFound {
            name: "LC_FILESET_ENTRY",
        });
    }
    let mut list = KextList::default();
    for (index, entry) in outer.fileset_entries().enumerate() {
        let result = usize::try_from(entry.fileoff)
            .map_err(|_| Error::out_of_bounds(entry.fileoff, 0, data.len()))
            .and_then(|offset| {
                record_at(data, index, offset, entry.entry_id, None, Some(entry.vmaddr))
            });
        list.push(index, result);
    }

    debug!("fileset scan found {} entries", list.len());
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::macho::{MH_FILESET, MH_KEXT_BUNDLE};
    use crate::testutil::*;

    #[test]
    fn test_fileset_without_entries() {
        let data = MachOBuilder::arm64(MH_FILESET)
            .segment("__TEXT", 0xfffffe0007004000, 0x1000, 0, 0x1000, &[])
            .build(0x1000);
        let outer = MachOImage::parse(&data).unwrap();
        let err = fileset_style(&outer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_merged_offset() {
        assert_eq!(
            merged_kext_offset(0xfffffff007008000, 0xfffffff007004000),
            0x4000
        );
        assert_eq!(untag_ptr(0x0017_fff0_0700_8000), 0xfffffff007008000);
    }

    #[test]
    fn test_extent_absolute_offsets() {
        let mut data = vec![0u8; 0x4000];
        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0x8000, 0x800, 0x1000, 0x800, &[])
            .segment("__TEXT_EXEC", 0x9000, 0x400, 0x1800, 0x400, &[])
            .segment("__LINKEDIT", 0xa000, 0x100, 0x3000, 0x100, &[])
            .write_into(&mut data, 0x1000);
        let image = MachOImage::parse_at(&data, 0x1000).unwrap();
        assert_eq!(kext_extent(&image, 0x1000).unwrap(), 0xc00);
    }

    #[test]
    fn test_extent_relative_offsets() {
        let mut data = vec![0u8; 0x3000];
        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0x8000, 0x800, 0, 0x800, &[])
            .write_into(&mut data, 0x2000);
        let image = MachOImage::parse_at(&data, 0x2000).unwrap();
        assert_eq!(kext_extent(&image, 0x2000).unwrap(), 0x800);
    }

    #[test]
    fn test_extent_past_buffer() {
        let mut data = vec![0u8; 0x1800];
        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0x8000, 0x1000, 0, 0x1000, &[])
            .write_into(&mut data, 0x1000);
        let image = MachOImage::parse_at(&data, 0x1000).unwrap();
        let err = kext_extent(&image, 0x1000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Bounds);
    }

    #[test]
    fn test_list_records_errors() {
        let mut list = KextList::default();
        list.push(0, Err(Error::parse(0x10, "bad")));
        assert!(list.is_empty());
        assert_eq!(list.errors.len(), 1);
        assert_eq!(list.errors[0].index, 0);
    }
}
