//! FAT (universal) archive decoding.
//!
//! FAT headers are always stored big-endian, whichever byte order the magic
//! was read in.

use crate::error::{Error, Result};
use crate::macho::{cpu_name, FAT_MAGIC, FAT_MAGIC_64};
use crate::util::{checked_range_u64, ByteView};

/// One architecture slice of a FAT archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    /// Returns the architecture name (e.g. "arm64e").
    pub fn name(&self) -> String {
        cpu_name(self.cputype, self.cpusubtype)
    }

    /// Returns the slice's bytes.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        checked_range_u64(data, self.offset, self.size)
    }
}

/// A decoded FAT header and its architecture table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatArchive {
    /// True for the `FAT_MAGIC_64` layout
    pub is_64: bool,
    /// Architecture descriptors in table order
    pub arches: Vec<FatArch>,
}

impl FatArchive {
    /// Size of the FAT header.
    pub const HEADER_SIZE: usize = 8;
    /// Size of a 32-bit `fat_arch` entry.
    pub const ARCH_SIZE: usize = 20;
    /// Size of a `fat_arch_64` entry.
    pub const ARCH_SIZE_64: usize = 32;

    /// Parses the FAT header at the start of `data`.
    ///
    /// Every slice must lie within `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let view = ByteView::new(data);
        let magic = view.u32_be(0)?;
        let is_64 = match magic {
            FAT_MAGIC => false,
            FAT_MAGIC_64 => true,
            other => {
                return Err(Error::InvalidFat {
                    reason: format!("bad magic {:#010x}", other),
                })
            }
        };
        let nfat_arch = view.u32_be(4)? as usize;
        let entry_size = if is_64 { Self::ARCH_SIZE_64 } else { Self::ARCH_SIZE };

        let table_len = nfat_arch
            .checked_mul(entry_size)
            .ok_or_else(|| Error::InvalidFat {
                reason: format!("{} architectures", nfat_arch),
            })?;
        view.bytes(Self::HEADER_SIZE, table_len)?;

        let mut arches = Vec::with_capacity(nfat_arch);
        let mut cur = view.cursor(Self::HEADER_SIZE);
        for _ in 0..nfat_arch {
            let cputype = cur.read_u32_be()?;
            let cpusubtype = cur.read_u32_be()?;
            let (offset, size, align) = if is_64 {
                let offset = cur.read_u64_be()?;
                let size = cur.read_u64_be()?;
                let align = cur.read_u32_be()?;
                cur.skip(4)?;
                (offset, size, align)
            } else {
                let offset = cur.read_u32_be()? as u64;
                let size = cur.read_u32_be()? as u64;
                (offset, size, cur.read_u32_be()?)
            };
            let arch = FatArch {
                cputype,
                cpusubtype,
                offset,
                size,
                align,
            };
            arch.slice(data)?;
            arches.push(arch);
        }

        if arches.is_empty() {
            return Err(Error::InvalidFat {
                reason: "no architectures".into(),
            });
        }

        Ok(Self { is_64, arches })
    }

    /// Returns the names of all slices in table order.
    pub fn arch_names(&self) -> Vec<String> {
        self.arches.iter().map(FatArch::name).collect()
    }

    /// Finds a slice by its formatted architecture name.
    pub fn find(&self, name: &str) -> Option<&FatArch> {
        self.arches.iter().find(|a| a.name() == name)
    }
}
