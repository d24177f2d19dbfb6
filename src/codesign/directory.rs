//! CodeDirectory decoding.
//!
//! A CodeDirectory is a fixed 44-byte base followed by field groups that were
//! appended as the format evolved. Each group is present only when the
//! directory's `version` is at least the version that introduced it, and the
//! groups always appear in introduction order. All fields are big-endian.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::util::{ByteView, Cursor};

use super::CSMAGIC_CODEDIRECTORY;

/// Size of the fields every CodeDirectory carries.
pub const CODEDIRECTORY_BASE_SIZE: usize = 44;

/// Version that introduced `scatterOffset`.
pub const CS_SUPPORTSSCATTER: u32 = 0x20100;
/// Version that introduced `teamOffset`.
pub const CS_SUPPORTSTEAMID: u32 = 0x20200;
/// Version that introduced `codeLimit64`.
pub const CS_SUPPORTSCODELIMIT64: u32 = 0x20300;
/// Version that introduced the executable segment fields.
pub const CS_SUPPORTSEXECSEG: u32 = 0x20400;
/// Version that introduced the hardened runtime version.
pub const CS_SUPPORTSRUNTIME: u32 = 0x20500;
/// Version that introduced the linkage hash fields.
pub const CS_SUPPORTSLINKAGE: u32 = 0x20600;

bitflags! {
    /// Code signing flags stored in a CodeDirectory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeSignFlags: u32 {
        /// Dynamically valid
        const VALID = 0x1;
        /// Ad hoc signed
        const ADHOC = 0x2;
        /// Has get-task-allow entitlement
        const GET_TASK_ALLOW = 0x4;
        /// Has installer entitlement
        const INSTALLER = 0x8;
        /// Library validation forced by the loader
        const FORCED_LV = 0x10;
        /// Invalid pages are allowed
        const INVALID_ALLOWED = 0x20;
        /// Don't load invalid pages
        const HARD = 0x100;
        /// Kill the process if it becomes invalid
        const KILL = 0x200;
        /// Force expiration checking
        const CHECK_EXPIRATION = 0x400;
        /// Restrict dyld loading
        const RESTRICT = 0x800;
        /// Require enforcement
        const ENFORCEMENT = 0x1000;
        /// Require library validation
        const REQUIRE_LV = 0x2000;
        /// Entitlements were validated
        const ENTITLEMENTS_VALIDATED = 0x4000;
        /// NVRAM access is unrestricted
        const NVRAM_UNRESTRICTED = 0x8000;
        /// Hardened runtime
        const RUNTIME = 0x10000;
        /// Signed automatically by the linker
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags! {
    /// Flags describing the main executable segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecSegFlags: u64 {
        /// Main binary
        const MAIN_BINARY = 0x1;
        /// Allow unsigned pages
        const ALLOW_UNSIGNED = 0x10;
        /// Main binary is a debugger
        const DEBUGGER = 0x20;
        /// JIT enabled
        const JIT = 0x40;
        /// Skip library validation
        const SKIP_LV = 0x80;
        /// Can bless a CDHash for execution
        const CAN_LOAD_CDHASH = 0x100;
        /// Can execute a blessed CDHash
        const CAN_EXEC_CDHASH = 0x200;
    }
}

/// Digest algorithm of the slot hashes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Unknown(u8),
}

impl HashType {
    /// Returns the on-disk value.
    pub fn raw(self) -> u8 {
        match self {
            HashType::None => 0,
            HashType::Sha1 => 1,
            HashType::Sha256 => 2,
            HashType::Sha256Truncated => 3,
            HashType::Sha384 => 4,
            HashType::Unknown(v) => v,
        }
    }

    /// Returns the display name.
    pub fn name(self) -> &'static str {
        match self {
            HashType::None => "none",
            HashType::Sha1 => "SHA-1",
            HashType::Sha256 => "SHA-256",
            HashType::Sha256Truncated => "SHA-256 (Truncated)",
            HashType::Sha384 => "SHA-384",
            HashType::Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for HashType {
    fn from(v: u8) -> Self {
        match v {
            0 => HashType::None,
            1 => HashType::Sha1,
            2 => HashType::Sha256,
            3 => HashType::Sha256Truncated,
            4 => HashType::Sha384,
            other => HashType::Unknown(other),
        }
    }
}

/// Returns the name of a special slot.
pub fn special_slot_name(slot: u32) -> &'static str {
    match slot {
        0 => "Code Directory",
        1 => "Bound Info.plist",
        2 => "Internal Requirements",
        3 => "Resource Directory (_CodeResources)",
        4 => "Application Specific",
        5 => "Entitlements",
        6 => "Entitlements DER",
        7 => "Launch Constraint - Self",
        8 => "Launch Constraint - Parent",
        9 => "Launch Constraint - Responsible",
        _ => "Unknown",
    }
}

// =============================================================================
// Extension groups
// =============================================================================

/// A version-gated field group following the base fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryExtension {
    /// Offset of the optional scatter vector
    Scatter {
        /// Offset of the scatter vector, 0 if absent
        scatter_offset: u32,
    },
    /// Offset of the team identifier
    TeamId {
        /// Offset of the team identifier string, 0 if absent
        team_offset: u32,
    },
    /// 64-bit code limit
    CodeLimit64 {
        /// Unused
        spare3: u32,
        /// Limit to main image signature range, 64 bits
        code_limit_64: u64,
    },
    /// Main executable segment
    ExecSegment {
        /// File offset of the executable segment
        base: u64,
        /// Limit of the executable segment
        limit: u64,
        /// Executable segment flags
        flags: ExecSegFlags,
    },
    /// Hardened runtime
    Runtime {
        /// Runtime version
        runtime: u32,
        /// Offset of the pre-encryption hash slots
        pre_encrypt_offset: u32,
    },
    /// Linkage hash
    Linkage {
        /// Hash algorithm of the linkage hash
        hash_type: u8,
        /// Linkage hash is truncated
        truncated: u8,
        /// Unused
        spare4: u16,
        /// Offset of the linkage hash
        offset: u32,
        /// Size of the linkage hash
        size: u32,
    },
}

struct ExtensionGroup {
    min_version: u32,
    decode: fn(&mut Cursor<'_>) -> Result<DirectoryExtension>,
}

const EXTENSION_GROUPS: [ExtensionGroup; 6] = [
    ExtensionGroup {
        min_version: CS_SUPPORTSSCATTER,
        decode: |c| {
            Ok(DirectoryExtension::Scatter {
                scatter_offset: c.read_u32_be()?,
            })
        },
    },
    ExtensionGroup {
        min_version: CS_SUPPORTSTEAMID,
        decode: |c| {
            Ok(DirectoryExtension::TeamId {
                team_offset: c.read_u32_be()?,
            })
        },
    },
    ExtensionGroup {
        min_version: CS_SUPPORTSCODELIMIT64,
        decode: |c| {
            Ok(DirectoryExtension::CodeLimit64 {
                spare3: c.read_u32_be()?,
                code_limit_64: c.read_u64_be()?,
            })
        },
    },
    ExtensionGroup {
        min_version: CS_SUPPORTSEXECSEG,
        decode: |c| {
            Ok(DirectoryExtension::ExecSegment {
                base: c.read_u64_be()?,
                limit: c.read_u64_be()?,
                flags: ExecSegFlags::from_bits_retain(c.read_u64_be()?),
            })
        },
    },
    ExtensionGroup {
        min_version: CS_SUPPORTSRUNTIME,
        decode: |c| {
            Ok(DirectoryExtension::Runtime {
                runtime: c.read_u32_be()?,
                pre_encrypt_offset: c.read_u32_be()?,
            })
        },
    },
    ExtensionGroup {
        min_version: CS_SUPPORTSLINKAGE,
        decode: |c| {
            Ok(DirectoryExtension::Linkage {
                hash_type: c.read_u8()?,
                truncated: c.read_u8()?,
                spare4: c.read_u16_be()?,
                offset: c.read_u32_be()?,
                size: c.read_u32_be()?,
            })
        },
    },
];

impl DirectoryExtension {
    /// Returns the CodeDirectory version that introduced this group.
    pub fn min_version(&self) -> u32 {
        match self {
            DirectoryExtension::Scatter { .. } => CS_SUPPORTSSCATTER,
            DirectoryExtension::TeamId { .. } => CS_SUPPORTSTEAMID,
            DirectoryExtension::CodeLimit64 { .. } => CS_SUPPORTSCODELIMIT64,
            DirectoryExtension::ExecSegment { .. } => CS_SUPPORTSEXECSEG,
            DirectoryExtension::Runtime { .. } => CS_SUPPORTSRUNTIME,
            DirectoryExtension::Linkage { .. } => CS_SUPPORTSLINKAGE,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            DirectoryExtension::Scatter { scatter_offset } => {
                out.extend_from_slice(&scatter_offset.to_be_bytes())
            }
            DirectoryExtension::TeamId { team_offset } => {
                out.extend_from_slice(&team_offset.to_be_bytes())
            }
            DirectoryExtension::CodeLimit64 {
                spare3,
                code_limit_64,
            } => {
                out.extend_from_slice(&spare3.to_be_bytes());
                out.extend_from_slice(&code_limit_64.to_be_bytes());
            }
            DirectoryExtension::ExecSegment { base, limit, flags } => {
                out.extend_from_slice(&base.to_be_bytes());
                out.extend_from_slice(&limit.to_be_bytes());
                out.extend_from_slice(&flags.bits().to_be_bytes());
            }
            DirectoryExtension::Runtime {
                runtime,
                pre_encrypt_offset,
            } => {
                out.extend_from_slice(&runtime.to_be_bytes());
                out.extend_from_slice(&pre_encrypt_offset.to_be_bytes());
            }
            DirectoryExtension::Linkage {
                hash_type,
                truncated,
                spare4,
                offset,
                size,
            } => {
                out.push(hash_type);
                out.push(truncated);
                out.extend_from_slice(&spare4.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
            }
        }
    }
}

// =============================================================================
// CodeDirectory
// =============================================================================

/// A hash stored in a special slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHash {
    /// Slot number, counted down from the hash array
    pub slot: u32,
    /// Digest bytes
    pub hash: Vec<u8>,
}

impl SlotHash {
    /// Returns the name of the slot.
    pub fn name(&self) -> &'static str {
        special_slot_name(self.slot)
    }
}

/// A decoded CodeDirectory blob.
#[derive(Debug, Clone)]
pub struct CodeDirectory {
    /// Total blob length
    pub length: u32,
    /// Format version
    pub version: u32,
    /// Signing flags
    pub flags: CodeSignFlags,
    /// Offset of hash slot 0
    pub hash_offset: u32,
    /// Offset of the identifier string
    pub ident_offset: u32,
    /// Number of special slots
    pub n_special_slots: u32,
    /// Number of code slots
    pub n_code_slots: u32,
    /// Limit to main image signature range
    pub code_limit: u32,
    /// Size of each hash in bytes
    pub hash_size: u8,
    /// Hash algorithm
    pub hash_type: HashType,
    /// Platform identifier, 0 if not a platform binary
    pub platform: u8,
    /// log2 of the page size, 0 for no paging
    pub page_size_log2: u8,
    /// Unused
    pub spare2: u32,
    /// Version-gated field groups, in on-disk order
    pub extensions: Vec<DirectoryExtension>,
    /// Signing identifier
    pub identifier: String,
    /// Team identifier, when present
    pub team_id: Option<String>,
    /// Special slot hashes, slot 1 first
    pub special_slots: Vec<SlotHash>,
    /// Code page hashes, in page order
    pub code_hashes: Vec<Vec<u8>>,
}

impl CodeDirectory {
    /// Decodes a CodeDirectory from a blob starting at its magic.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let view = ByteView::new(blob);
        let mut cur = view.cursor(0);

        let magic = cur.read_u32_be()?;
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::InvalidBlobMagic { magic, offset: 0 });
        }
        let length = cur.read_u32_be()?;
        let version = cur.read_u32_be()?;
        let flags = CodeSignFlags::from_bits_retain(cur.read_u32_be()?);
        let hash_offset = cur.read_u32_be()?;
        let ident_offset = cur.read_u32_be()?;
        let n_special_slots = cur.read_u32_be()?;
        let n_code_slots = cur.read_u32_be()?;
        let code_limit = cur.read_u32_be()?;
        let hash_size = cur.read_u8()?;
        let hash_type = HashType::from(cur.read_u8()?);
        let platform = cur.read_u8()?;
        let page_size_log2 = cur.read_u8()?;
        let spare2 = cur.read_u32_be()?;

        let mut extensions = Vec::new();
        for group in EXTENSION_GROUPS.iter().take_while(|g| version >= g.min_version) {
            extensions.push((group.decode)(&mut cur)?);
        }

        let identifier = view.cstr_at(ident_offset as usize)?;
        let team_id = extensions
            .iter()
            .find_map(|ext| match ext {
                DirectoryExtension::TeamId { team_offset } if *team_offset != 0 => {
                    Some(*team_offset)
                }
                _ => None,
            })
            .map(|off| view.cstr_at(off as usize))
            .transpose()?;

        let size = hash_size as usize;
        if size == 0 && (n_special_slots != 0 || n_code_slots != 0) {
            return Err(Error::parse(hash_offset as usize, "zero hash size with hash slots"));
        }
        let special_len = (n_special_slots as usize)
            .checked_mul(size)
            .filter(|&len| len <= hash_offset as usize)
            .ok_or_else(|| {
                Error::parse(
                    hash_offset as usize,
                    format!("{} special slots precede blob", n_special_slots),
                )
            })?;
        let code_len = (n_code_slots as usize)
            .checked_mul(size)
            .ok_or_else(|| Error::parse(hash_offset as usize, "code slot array overflows"))?;

        let special_start = hash_offset as usize - special_len;
        let special_slots = view
            .bytes(special_start, special_len)?
            .chunks_exact(size.max(1))
            .rev()
            .zip(1..)
            .map(|(hash, slot)| SlotHash {
                slot,
                hash: hash.to_vec(),
            })
            .collect();

        let code_hashes = view
            .bytes(hash_offset as usize, code_len)?
            .chunks_exact(size.max(1))
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self {
            length,
            version,
            flags,
            hash_offset,
            ident_offset,
            n_special_slots,
            n_code_slots,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size_log2,
            spare2,
            extensions,
            identifier,
            team_id,
            special_slots,
            code_hashes,
        })
    }

    /// Returns the page size in bytes, or 0 for an unpaged signature.
    pub fn page_size(&self) -> u64 {
        match self.page_size_log2 {
            0 => 0,
            n => 1u64 << n,
        }
    }

    /// Returns the executable segment `(base, limit, flags)`.
    pub fn exec_segment(&self) -> Option<(u64, u64, ExecSegFlags)> {
        self.extensions.iter().find_map(|ext| match *ext {
            DirectoryExtension::ExecSegment { base, limit, flags } => Some((base, limit, flags)),
            _ => None,
        })
    }

    /// Returns the 64-bit code limit.
    pub fn code_limit_64(&self) -> Option<u64> {
        self.extensions.iter().find_map(|ext| match *ext {
            DirectoryExtension::CodeLimit64 { code_limit_64, .. } => Some(code_limit_64),
            _ => None,
        })
    }

    /// Returns the hardened runtime version.
    pub fn runtime(&self) -> Option<u32> {
        self.extensions.iter().find_map(|ext| match *ext {
            DirectoryExtension::Runtime { runtime, .. } => Some(runtime),
            _ => None,
        })
    }

    /// Returns the linkage group.
    pub fn linkage(&self) -> Option<&DirectoryExtension> {
        self.extensions
            .iter()
            .find(|ext| matches!(ext, DirectoryExtension::Linkage { .. }))
    }

    /// Re-encodes the base fields and extension groups in on-disk order.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CODEDIRECTORY_BASE_SIZE + 64);
        for v in [
            CSMAGIC_CODEDIRECTORY,
            self.length,
            self.version,
            self.flags.bits(),
            self.hash_offset,
            self.ident_offset,
            self.n_special_slots,
            self.n_code_slots,
            self.code_limit,
        ] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&[
            self.hash_size,
            self.hash_type.raw(),
            self.platform,
            self.page_size_log2,
        ]);
        out.extend_from_slice(&self.spare2.to_be_bytes());
        for ext in &self.extensions {
            ext.encode(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn test_base_fields() {
        let blob = code_directory_blob(0x20001, "com.example.tool", 2, 3);
        let cd = CodeDirectory::parse(&blob).unwrap();

        assert_eq!(cd.version, 0x20001);
        assert_eq!(cd.identifier, "com.example.tool");
        assert!(cd.flags.contains(CodeSignFlags::ADHOC | CodeSignFlags::LINKER_SIGNED));
        assert_eq!(cd.hash_type, HashType::Sha256);
        assert_eq!(cd.hash_type.name(), "SHA-256");
        assert_eq!(cd.page_size(), 0x1000);
        assert!(cd.extensions.is_empty());
        assert_eq!(cd.team_id, None);
    }

    #[test]
    fn test_slots() {
        let blob = code_directory_blob(0x20400, "a", 5, 2);
        let cd = CodeDirectory::parse(&blob).unwrap();

        assert_eq!(cd.special_slots.len(), 5);
        assert_eq!(cd.special_slots[0].hash, vec![1u8; 32]);
        assert_eq!(cd.special_slots[4].slot, 5);
        assert_eq!(cd.special_slots[4].name(), "Entitlements");
        assert_eq!(cd.special_slots[4].hash, vec![5u8; 32]);
        assert_eq!(cd.code_hashes, vec![vec![0xa0u8; 32], vec![0xa1u8; 32]]);
    }

    #[test]
    fn test_version_gating() {
        let older = CodeDirectory::parse(&code_directory_blob(0x20100, "a", 0, 0)).unwrap();
        assert_eq!(
            older.extensions,
            vec![DirectoryExtension::Scatter { scatter_offset: 0 }]
        );
        assert!(older.exec_segment().is_none());
        assert!(older.linkage().is_none());

        let exec = CodeDirectory::parse(&code_directory_blob(0x20400, "a", 0, 0)).unwrap();
        assert_eq!(
            exec.exec_segment(),
            Some((0, 0x4000, ExecSegFlags::MAIN_BINARY))
        );
        assert_eq!(exec.code_limit_64(), Some(0));
        assert!(exec.runtime().is_none());

        let newest = CodeDirectory::parse(&code_directory_blob(0x20600, "a", 0, 0)).unwrap();
        assert_eq!(newest.extensions.len(), 6);
        assert_eq!(newest.runtime(), Some(0x000d_0000));
        assert!(matches!(
            newest.linkage(),
            Some(DirectoryExtension::Linkage { hash_type: 2, .. })
        ));
        for pair in newest.extensions.windows(2) {
            assert!(pair[0].min_version() < pair[1].min_version());
        }
    }

    #[test]
    fn test_encode_header_round_trip() {
        for (version, header_len) in [(0x20001, 44), (0x20300, 64), (0x20600, 108)] {
            let blob = code_directory_blob(version, "com.example", 1, 1);
            let cd = CodeDirectory::parse(&blob).unwrap();
            assert_eq!(cd.encode_header(), blob[..header_len].to_vec());
        }
    }

    #[test]
    fn test_team_id() {
        let mut blob = code_directory_blob(0x20200, "com.example", 0, 0);
        let team_at = blob.len();
        blob.extend_from_slice(b"ABCDE12345\0");
        put_u32_be(&mut blob, 48, team_at as u32);
        let len = blob.len() as u32;
        put_u32_be(&mut blob, 4, len);

        let cd = CodeDirectory::parse(&blob).unwrap();
        assert_eq!(cd.team_id.as_deref(), Some("ABCDE12345"));
    }

    #[test]
    fn test_slot_counts_bounded_by_blob() {
        let mut blob = code_directory_blob(0x20400, "a", 0, 0);
        put_u32_be(&mut blob, 24, u32::MAX);
        assert!(CodeDirectory::parse(&blob).is_err());

        blob[36] = 0;
        assert!(CodeDirectory::parse(&blob).is_err());

        let mut blob = code_directory_blob(0x20400, "a", 0, 0);
        put_u32_be(&mut blob, 28, u32::MAX);
        assert!(CodeDirectory::parse(&blob).is_err());
    }

    #[test]
    fn test_truncated_hashes() {
        let mut blob = code_directory_blob(0x20001, "a", 0, 4);
        blob.truncate(blob.len() - 16);
        assert!(CodeDirectory::parse(&blob).is_err());
        assert!(CodeDirectory::parse(&blob[..20]).is_err());
    }
}
