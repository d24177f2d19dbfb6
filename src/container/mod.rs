//! Container classification.
//!
//! The first four bytes of a file decide how the rest is decoded: a single
//! Mach-O image, a FAT archive of Mach-O slices, an ELF file (recognized but
//! not decoded) or an Image4 container. Anything else is reported as
//! unrecognized.

mod fat;
mod image4;

pub use fat::*;
pub use image4::*;

use std::fmt;

use crate::error::{Error, Result};
use crate::macho::*;

/// The outer format of a loaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    /// A single Mach-O image
    MachO {
        /// 64-bit header
        is_64: bool,
        /// Byte-swapped magic
        big_endian: bool,
    },
    /// A FAT archive and its architecture table
    Fat(FatArchive),
    /// An ELF file
    Elf,
    /// An Image4 container
    Image4(Image4Type),
}

impl Container {
    /// Classifies `data` by its magic number.
    pub fn classify(data: &[u8]) -> Result<Self> {
        let (magic, fat_magic) = match data.get(..4) {
            Some(b) => (
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            ),
            None => {
                return Err(Error::UnrecognizedFormat { magic: 0 });
            }
        };

        // FAT headers are always stored big-endian.
        if matches!(fat_magic, FAT_MAGIC | FAT_MAGIC_64) {
            return Ok(Container::Fat(FatArchive::parse(data)?));
        }

        let container = match magic {
            MH_MAGIC_64 => Container::MachO {
                is_64: true,
                big_endian: false,
            },
            MH_MAGIC => Container::MachO {
                is_64: false,
                big_endian: false,
            },
            MH_CIGAM_64 => Container::MachO {
                is_64: true,
                big_endian: true,
            },
            MH_CIGAM => Container::MachO {
                is_64: false,
                big_endian: true,
            },
            ELF_MAGIC | ELF_CIGAM => Container::Elf,
            _ => match sniff(data) {
                Some(kind) => Container::Image4(kind),
                None => return Err(Error::UnrecognizedFormat { magic }),
            },
        };

        Ok(container)
    }

    /// Returns true if the container is a FAT archive.
    #[inline]
    pub fn is_fat(&self) -> bool {
        matches!(self, Container::Fat(_))
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::MachO { is_64, big_endian } => write!(
                f,
                "Mach-O {}-bit{}",
                if *is_64 { 64 } else { 32 },
                if *big_endian { " (big-endian)" } else { "" }
            ),
            Container::Fat(archive) => write!(
                f,
                "FAT{} archive ({} architectures)",
                if archive.is_64 { "64" } else { "" },
                archive.arches.len()
            ),
            Container::Elf => f.write_str("ELF"),
            Container::Image4(kind) => write!(f, "Image4 ({})", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::*;

    #[test]
    fn test_classify_macho() {
        let data = simple_arm64(0x100);
        assert_eq!(
            Container::classify(&data).unwrap(),
            Container::MachO {
                is_64: true,
                big_endian: false
            }
        );

        let data32 = MachOBuilder::new32(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, MH_EXECUTE).build(0x100);
        assert_eq!(
            Container::classify(&data32).unwrap().to_string(),
            "Mach-O 32-bit"
        );
    }

    #[test]
    fn test_classify_fat_and_others() {
        let data = fat(&[(CPU_TYPE_ARM64, 0, simple_arm64(0x100))]);
        assert!(Container::classify(&data).unwrap().is_fat());

        assert_eq!(
            Container::classify(b"\x7fELF\x02\x01\x01\0").unwrap(),
            Container::Elf
        );

        let img4 = [0x30, 0x10, 0x16, 0x04, b'I', b'M', b'4', b'M'];
        assert_eq!(
            Container::classify(&img4).unwrap(),
            Container::Image4(Image4Type::Im4m)
        );
    }

    #[test]
    fn test_classify_swapped_fat_magic() {
        let mut data = fat(&[(CPU_TYPE_ARM64, 0, simple_arm64(0x100))]);
        let container = Container::classify(&data).unwrap();
        assert_eq!(container.to_string(), "FAT archive (1 architectures)");

        put_bytes(&mut data, 0, &FAT_MAGIC.to_le_bytes());
        let err = Container::classify(&data).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { magic } if magic == FAT_MAGIC));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_classify_unrecognized() {
        let err = Container::classify(b"hello world").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(Container::classify(b"ab").unwrap_err().kind(), ErrorKind::Format);
    }
}
