//! File loading and architecture selection.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::macho::MachOImage;

/// A read-only memory-mapped input file.
///
/// Every decoded view borrows from the mapping, so the file must outlive
/// them.
#[derive(Debug)]
pub struct LoadedFile {
    path: PathBuf,
    mmap: Mmap,
}

impl LoadedFile {
    /// Maps the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: the mapping is read-only and private to this process.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        debug!("mapped {} ({:#x} bytes)", path.display(), mmap.len());
        Ok(Self { path, mmap })
    }

    /// Returns the mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Returns the path the file was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Maps `path` and classifies its container format.
pub fn load_and_classify<P: AsRef<Path>>(path: P) -> Result<(LoadedFile, Container)> {
    let file = LoadedFile::open(path)?;
    let container = Container::classify(file.data())?;
    debug!("classified {} as {}", file.path().display(), container);
    Ok((file, container))
}

/// Selects one Mach-O image from a classified container.
///
/// A FAT archive requires an explicit architecture name; a single Mach-O is
/// returned as is unless a name is given that does not match it.
pub fn select_architecture<'a>(
    data: &'a [u8],
    container: &Container,
    arch: Option<&str>,
) -> Result<MachOImage<'a>> {
    match container {
        Container::Fat(archive) => {
            let Some(name) = arch else {
                return Err(Error::AmbiguousArchitecture {
                    available: archive.arch_names(),
                });
            };
            let slice = archive.find(name).ok_or_else(|| Error::ArchNotFound {
                name: name.to_string(),
                available: archive.arch_names(),
            })?;
            debug!(
                "selected {} slice at {:#x} ({:#x} bytes)",
                name, slice.offset, slice.size
            );
            MachOImage::parse(slice.slice(data)?)
        }
        Container::MachO { .. } => {
            let image = MachOImage::parse(data)?;
            if let Some(name) = arch {
                let actual = image.arch_name();
                if actual != name {
                    return Err(Error::ArchNotFound {
                        name: name.to_string(),
                        available: vec![actual],
                    });
                }
            }
            Ok(image)
        }
        Container::Elf => Err(Error::unsupported("ELF binaries")),
        Container::Image4(kind) => Err(Error::unsupported(format!("Image4 {} payloads", kind))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::macho::*;
    use crate::testutil::*;

    fn two_slice_fat() -> Vec<u8> {
        fat(&[
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, simple_arm64(0x200)),
            (
                CPU_TYPE_X86_64,
                CPU_SUBTYPE_X86_64_ALL,
                MachOBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, MH_EXECUTE)
                    .segment("__TEXT", 0x1_0000_0000, 0x300, 0, 0x300, &[])
                    .build(0x300),
            ),
        ])
    }

    #[test]
    fn test_fat_requires_arch() {
        let data = two_slice_fat();
        let container = Container::classify(&data).unwrap();
        let err = select_architecture(&data, &container, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Architecture);
        match err {
            Error::AmbiguousArchitecture { available } => {
                assert_eq!(available, vec!["arm64", "x86_64"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fat_select_slice() {
        let data = two_slice_fat();
        let container = Container::classify(&data).unwrap();

        let arm = select_architecture(&data, &container, Some("arm64")).unwrap();
        assert!(arm.header.is_arm64());
        assert_eq!(arm.data().len(), 0x200);
        assert_eq!(arm.data().as_ptr(), data[0x1000..].as_ptr());

        let x86 = select_architecture(&data, &container, Some("x86_64")).unwrap();
        assert!(x86.header.is_x86_64());
        assert_eq!(x86.data().len(), 0x300);

        let err = select_architecture(&data, &container, Some("armv7")).unwrap_err();
        assert!(matches!(err, Error::ArchNotFound { .. }));
    }

    #[test]
    fn test_single_macho_arch_check() {
        let data = simple_arm64(0x100);
        let container = Container::classify(&data).unwrap();
        assert!(select_architecture(&data, &container, None).is_ok());
        assert!(select_architecture(&data, &container, Some("arm64")).is_ok());
        assert!(matches!(
            select_architecture(&data, &container, Some("x86_64")),
            Err(Error::ArchNotFound { .. })
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let err = load_and_classify("/nonexistent/machscope-input").unwrap_err();
        assert!(matches!(err, Error::FileOpen { .. }));
        assert!(!err.is_recoverable());
    }
}
