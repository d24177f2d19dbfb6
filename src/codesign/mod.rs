//! Code signature decoding.
//!
//! `LC_CODE_SIGNATURE` points at a SuperBlob: a big-endian header followed by
//! an index of `(slot type, offset)` pairs. The kind of each blob is decided
//! by the magic at its offset, not by the slot type. Blobs that fail to
//! decode are recorded as [`ItemError`]s and the remaining index entries are
//! still decoded.

mod cms;
mod directory;
mod requirements;

pub use cms::*;
pub use directory::*;
pub use requirements::*;

use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::error::{Error, ItemError, Result};
use crate::macho::MachOImage;
use crate::util::{checked_range, ByteView};

/// Single requirement.
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;
/// Requirement set.
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
/// CodeDirectory.
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
/// Embedded signature SuperBlob.
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
/// Embedded signature SuperBlob, pre-Leopard layout.
pub const CSMAGIC_EMBEDDED_SIGNATURE_OLD: u32 = 0xface0b02;
/// Detached signature SuperBlob.
pub const CSMAGIC_DETACHED_SIGNATURE: u32 = 0xfade0cc1;
/// XML entitlements.
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
/// DER entitlements.
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
/// CMS signature wrapper.
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Returns the display name of a blob magic.
pub fn blob_magic_name(magic: u32) -> &'static str {
    match magic {
        CSMAGIC_REQUIREMENT => "Requirement",
        CSMAGIC_REQUIREMENTS => "Requirement Set",
        CSMAGIC_CODEDIRECTORY => "Code Directory",
        CSMAGIC_EMBEDDED_SIGNATURE => "Embedded Signature",
        CSMAGIC_EMBEDDED_SIGNATURE_OLD => "Embedded Signature (old)",
        CSMAGIC_DETACHED_SIGNATURE => "Detached Signature",
        CSMAGIC_EMBEDDED_ENTITLEMENTS => "Entitlements (XML)",
        CSMAGIC_EMBEDDED_DER_ENTITLEMENTS => "Entitlements (DER)",
        CSMAGIC_BLOBWRAPPER => "CMS Signature",
        _ => "Unknown",
    }
}

/// Formats a digest as lowercase hex.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// An entry of the SuperBlob index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobIndex {
    /// Slot type
    pub slot: u32,
    /// Offset of the blob from the start of the SuperBlob
    pub offset: u32,
}

/// A decoded blob.
#[derive(Debug, Clone)]
pub enum Blob {
    /// Code directory
    CodeDirectory(CodeDirectory),
    /// CMS signature wrapper
    Cms(CmsSignature),
    /// Requirement set
    Requirements(RequirementSet),
    /// DER entitlements, size only
    DerEntitlements {
        /// Blob length
        length: u32,
    },
    /// XML entitlements, size only
    XmlEntitlements {
        /// Blob length
        length: u32,
    },
    /// A blob magic with no decoder
    Unrecognized {
        /// Blob magic
        magic: u32,
    },
}

/// A blob together with the index entry that located it.
#[derive(Debug, Clone)]
pub struct SignatureBlob {
    /// Index entry
    pub index: BlobIndex,
    /// Decoded contents
    pub blob: Blob,
}

/// A decoded SuperBlob.
#[derive(Debug)]
pub struct CodeSignature {
    /// SuperBlob magic
    pub magic: u32,
    /// SuperBlob length
    pub length: u32,
    /// Number of index entries
    pub count: u32,
    /// Blobs that decoded, in index order
    pub blobs: Vec<SignatureBlob>,
    /// Blobs that failed to decode
    pub errors: Vec<ItemError>,
}

impl CodeSignature {
    /// Decodes a SuperBlob.
    ///
    /// Only a malformed SuperBlob header is fatal.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let view = ByteView::new(data);
        let magic = view.u32_be(0)?;
        if !matches!(
            magic,
            CSMAGIC_EMBEDDED_SIGNATURE | CSMAGIC_EMBEDDED_SIGNATURE_OLD | CSMAGIC_DETACHED_SIGNATURE
        ) {
            return Err(Error::InvalidBlobMagic { magic, offset: 0 });
        }
        let length = view.u32_be(4)?;
        let count = view.u32_be(8)?;
        debug!(
            "{} of {:#x} bytes with {} blobs",
            blob_magic_name(magic),
            length,
            count
        );

        let mut signature = Self {
            magic,
            length,
            count,
            blobs: Vec::new(),
            errors: Vec::new(),
        };

        for i in 0..count as usize {
            let index = match (view.u32_be(12 + i * 8), view.u32_be(16 + i * 8)) {
                (Ok(slot), Ok(offset)) => BlobIndex { slot, offset },
                (Err(e), _) | (_, Err(e)) => {
                    signature.errors.push(ItemError::new(i, e));
                    break;
                }
            };
            match decode_blob(&view, index) {
                Ok(blob) => signature.blobs.push(SignatureBlob { index, blob }),
                Err(e) => {
                    warn!("code signature blob {}: {}", i, e);
                    signature.errors.push(ItemError::new(i, e));
                }
            }
        }

        Ok(signature)
    }

    /// Returns the code directories, primary first.
    pub fn code_directories(&self) -> impl Iterator<Item = &CodeDirectory> {
        self.blobs.iter().filter_map(|b| match &b.blob {
            Blob::CodeDirectory(cd) => Some(cd),
            _ => None,
        })
    }
}

fn decode_blob(view: &ByteView<'_>, index: BlobIndex) -> Result<Blob> {
    let blob = view.tail(index.offset as usize)?;
    let magic = blob.u32_be(0)?;
    let bytes = blob.as_slice();
    Ok(match magic {
        CSMAGIC_CODEDIRECTORY => Blob::CodeDirectory(CodeDirectory::parse(bytes)?),
        CSMAGIC_BLOBWRAPPER => Blob::Cms(CmsSignature::parse(bytes)?),
        CSMAGIC_REQUIREMENTS => Blob::Requirements(RequirementSet::parse(bytes)?),
        CSMAGIC_EMBEDDED_DER_ENTITLEMENTS => Blob::DerEntitlements {
            length: blob.u32_be(4)?,
        },
        CSMAGIC_EMBEDDED_ENTITLEMENTS => Blob::XmlEntitlements {
            length: blob.u32_be(4)?,
        },
        other => {
            warn!("Code Signature blob {:#010x} not implemented", other);
            Blob::Unrecognized { magic: other }
        }
    })
}

/// Decodes the code signature of an image.
pub fn decode_code_signature(macho: &MachOImage<'_>) -> Result<CodeSignature> {
    let cmd = macho
        .code_signature()
        .ok_or(Error::LoadCommandNotFound {
            name: "LC_CODE_SIGNATURE",
        })?;
    let data = checked_range(macho.data(), cmd.dataoff as usize, cmd.datasize as usize)?;
    CodeSignature::parse(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::macho::MH_EXECUTE;
    use crate::testutil::*;

    #[test]
    fn test_superblob_dispatch() {
        let data = superblob(&[
            (0, code_directory_blob(0x20400, "com.example", 5, 1)),
            (2, generic_blob(CSMAGIC_REQUIREMENTS, &[0, 0, 0, 0])),
            (5, generic_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, b"<plist/>")),
            (7, generic_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, &[0x70, 0])),
            (0x10000, generic_blob(CSMAGIC_BLOBWRAPPER, &[])),
            (0x20, generic_blob(0xfade0cff, &[1, 2, 3, 4])),
        ]);

        let sig = CodeSignature::parse(&data).unwrap();
        assert_eq!(sig.count, 6);
        assert!(sig.errors.is_empty());
        assert_eq!(sig.blobs.len(), 6);
        assert_eq!(sig.code_directories().next().unwrap().identifier, "com.example");
        assert!(matches!(sig.blobs[1].blob, Blob::Requirements(ref r) if r.requirements.is_empty()));
        assert!(matches!(sig.blobs[2].blob, Blob::XmlEntitlements { length: 16 }));
        assert!(matches!(sig.blobs[3].blob, Blob::DerEntitlements { length: 10 }));
        assert!(matches!(sig.blobs[4].blob, Blob::Cms(ref c) if c.subjects.is_empty()));
        assert!(matches!(
            sig.blobs[5].blob,
            Blob::Unrecognized { magic: 0xfade0cff }
        ));
        assert_eq!(sig.blobs[4].index.slot, 0x10000);
    }

    #[test]
    fn test_bad_blob_is_item_error() {
        let mut data = superblob(&[
            (0, code_directory_blob(0x20001, "a", 0, 0)),
            (5, generic_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, b"x")),
        ]);
        // Point the first blob past the end.
        put_u32_be(&mut data, 16, 0x10000);

        let sig = CodeSignature::parse(&data).unwrap();
        assert_eq!(sig.blobs.len(), 1);
        assert_eq!(sig.errors.len(), 1);
        assert_eq!(sig.errors[0].index, 0);
        assert_eq!(sig.errors[0].error.kind(), ErrorKind::Bounds);
        assert!(sig.errors[0].error.is_recoverable());
    }

    #[test]
    fn test_bad_superblob_magic() {
        let mut data = superblob(&[]);
        put_u32_be(&mut data, 0, 0x12345678);
        assert!(matches!(
            CodeSignature::parse(&data),
            Err(Error::InvalidBlobMagic { magic: 0x12345678, .. })
        ));
    }

    #[test]
    fn test_decode_from_macho() {
        let sig = superblob(&[(0, code_directory_blob(0x20500, "com.example.bin", 2, 2))]);
        let mut data = MachOBuilder::arm64(MH_EXECUTE)
            .code_signature(0x1000, sig.len() as u32)
            .build(0x1000 + sig.len());
        put_bytes(&mut data, 0x1000, &sig);

        let image = MachOImage::parse(&data).unwrap();
        let decoded = decode_code_signature(&image).unwrap();
        let cd = decoded.code_directories().next().unwrap();
        assert_eq!(cd.identifier, "com.example.bin");
        assert_eq!(cd.runtime(), Some(0x000d_0000));
        assert_eq!(hex_string(&cd.code_hashes[1][..4]), "a1a1a1a1");

        let unsigned = simple_arm64(0x1000);
        let image = MachOImage::parse(&unsigned).unwrap();
        assert!(matches!(
            decode_code_signature(&image),
            Err(Error::LoadCommandNotFound { .. })
        ));
    }
}
