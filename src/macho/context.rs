//! Read-only Mach-O image over a borrowed buffer.
//!
//! A [`MachOImage`] is parsed from a header located anywhere inside a larger
//! buffer. Segment file offsets are interpreted relative to that buffer, which
//! matches both standalone files and the images nested inside kernelcaches,
//! where every inner header still records offsets from the start of the file.

use std::collections::HashMap;

use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::constants::*;
use super::names::load_command_name;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{checked_range, checked_range_u64, fixed_str, read_struct};

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command (widened for 32-bit images)
    pub command: SegmentCommand64,
    /// Offset of the segment command in the buffer
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }

    /// Returns the end of the segment's file range.
    #[inline]
    pub fn file_end(&self) -> u64 {
        self.command.fileoff.saturating_add(self.command.filesize)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure (widened for 32-bit images)
    pub section: Section64,
    /// Offset of the section structure in the buffer
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }

    /// Returns the full name (segment,section).
    pub fn full_name(&self) -> String {
        format!("{},{}", self.section.segment_name(), self.section.name())
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// The variant names correspond to the load command types. Commands the
/// crate does not interpret are kept as [`LoadCommandInfo::Unknown`] so the
/// full stream can still be listed.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    DyldInfo {
        command: DyldInfoCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Path {
        cmd: u32,
        cmdsize: u32,
        path: String,
        offset: usize,
    },
    Uuid {
        command: UuidCommand,
        offset: usize,
    },
    BuildVersion {
        command: BuildVersionCommand,
        offset: usize,
    },
    SourceVersion {
        command: SourceVersionCommand,
        offset: usize,
    },
    EncryptionInfo {
        command: EncryptionInfoCommand,
        offset: usize,
    },
    FilesetEntry {
        command: FilesetEntryCommand,
        entry_id: String,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. }
            | LoadCommandInfo::Dysymtab { offset, .. }
            | LoadCommandInfo::DyldInfo { offset, .. }
            | LoadCommandInfo::LinkeditData { offset, .. }
            | LoadCommandInfo::Dylib { offset, .. }
            | LoadCommandInfo::Path { offset, .. }
            | LoadCommandInfo::Uuid { offset, .. }
            | LoadCommandInfo::BuildVersion { offset, .. }
            | LoadCommandInfo::SourceVersion { offset, .. }
            | LoadCommandInfo::EncryptionInfo { offset, .. }
            | LoadCommandInfo::FilesetEntry { offset, .. }
            | LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }

    /// Returns the load command type.
    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmd,
            LoadCommandInfo::Symtab { command, .. } => command.cmd,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmd,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmd,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmd,
            LoadCommandInfo::Dylib { command, .. } => command.cmd,
            LoadCommandInfo::Path { cmd, .. } => *cmd,
            LoadCommandInfo::Uuid { command, .. } => command.cmd,
            LoadCommandInfo::BuildVersion { command, .. } => command.cmd,
            LoadCommandInfo::SourceVersion { command, .. } => command.cmd,
            LoadCommandInfo::EncryptionInfo { command, .. } => command.cmd,
            LoadCommandInfo::FilesetEntry { command, .. } => command.cmd,
            LoadCommandInfo::Unknown { cmd, .. } => *cmd,
        }
    }

    /// Returns the load command size.
    pub fn size(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmdsize,
            LoadCommandInfo::Symtab { command, .. } => command.cmdsize,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmdsize,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmdsize,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmdsize,
            LoadCommandInfo::Dylib { command, .. } => command.cmdsize,
            LoadCommandInfo::Path { cmdsize, .. } => *cmdsize,
            LoadCommandInfo::Uuid { command, .. } => command.cmdsize,
            LoadCommandInfo::BuildVersion { command, .. } => command.cmdsize,
            LoadCommandInfo::SourceVersion { command, .. } => command.cmdsize,
            LoadCommandInfo::EncryptionInfo { command, .. } => command.cmdsize,
            LoadCommandInfo::FilesetEntry { command, .. } => command.cmdsize,
            LoadCommandInfo::Unknown { cmdsize, .. } => *cmdsize,
        }
    }

    /// Returns the symbolic name of the command type.
    pub fn name(&self) -> &'static str {
        load_command_name(self.cmd())
    }

    /// One-line description of the command's payload.
    pub fn summary(&self) -> String {
        match self {
            LoadCommandInfo::Segment(s) => format!(
                "{:<16} vm {:#018x}-{:#018x} file {:#x}-{:#x} ({} sections)",
                s.name(),
                s.command.vmaddr,
                s.command.vmaddr.wrapping_add(s.command.vmsize),
                s.command.fileoff,
                s.file_end(),
                s.sections.len()
            ),
            LoadCommandInfo::Symtab { command, .. } => format!(
                "symoff {:#x} nsyms {} stroff {:#x} strsize {:#x}",
                command.symoff, command.nsyms, command.stroff, command.strsize
            ),
            LoadCommandInfo::Dysymtab { command, .. } => format!(
                "locals {} extdefs {} undefs {} indirect {}",
                command.nlocalsym, command.nextdefsym, command.nundefsym, command.nindirectsyms
            ),
            LoadCommandInfo::DyldInfo { command, .. } => format!(
                "rebase {:#x} bind {:#x} lazy {:#x} export {:#x}",
                command.rebase_off, command.bind_off, command.lazy_bind_off, command.export_off
            ),
            LoadCommandInfo::LinkeditData { command, .. } => {
                format!("dataoff {:#x} datasize {:#x}", command.dataoff, command.datasize)
            }
            LoadCommandInfo::Dylib { command, name, .. } => format!(
                "{} (compatibility {}, current {})",
                name,
                format_packed_version(command.dylib.compatibility_version),
                format_packed_version(command.dylib.current_version)
            ),
            LoadCommandInfo::Path { path, .. } => path.clone(),
            LoadCommandInfo::Uuid { command, .. } => {
                Uuid::from_bytes(command.uuid).hyphenated().to_string().to_uppercase()
            }
            LoadCommandInfo::BuildVersion { command, .. } => format!(
                "platform {} minos {} sdk {}",
                super::names::platform_name(command.platform),
                format_packed_version(command.minos),
                format_packed_version(command.sdk)
            ),
            LoadCommandInfo::SourceVersion { command, .. } => {
                format_source_version(command.version)
            }
            LoadCommandInfo::EncryptionInfo { command, .. } => format!(
                "cryptoff {:#x} cryptsize {:#x} cryptid {}",
                command.cryptoff, command.cryptsize, command.cryptid
            ),
            LoadCommandInfo::FilesetEntry {
                command, entry_id, ..
            } => format!(
                "{} vmaddr {:#x} fileoff {:#x}",
                entry_id, command.vmaddr, command.fileoff
            ),
            LoadCommandInfo::Unknown { cmd, cmdsize, .. } => {
                format!("cmd {:#x} size {:#x}", cmd, cmdsize)
            }
        }
    }
}

/// One entry of an `MH_FILESET` image.
#[derive(Debug, Clone)]
pub struct FilesetEntry {
    /// Bundle identifier of the entry
    pub entry_id: String,
    /// Virtual address of the entry's header
    pub vmaddr: u64,
    /// File offset of the entry's header
    pub fileoff: u64,
}

// =============================================================================
// Mach-O Image
// =============================================================================

/// A parsed Mach-O image borrowing its bytes.
///
/// 32-bit images are widened into the 64-bit records on load, so callers
/// inspect `header`, segments and sections the same way for both widths.
#[derive(Debug, Clone)]
pub struct MachOImage<'a> {
    /// The Mach-O header (widened for 32-bit images)
    pub header: MachHeader64,
    /// True for `MH_MAGIC_64` images
    pub is_64: bool,
    /// Offset of the header within the buffer
    pub header_offset: usize,
    /// Parsed load commands in file order
    pub load_commands: Vec<LoadCommandInfo>,
    data: &'a [u8],
    segment_indices: HashMap<String, usize>,
}

impl<'a> MachOImage<'a> {
    /// Parses an image whose header starts at offset 0 of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        Self::parse_at(data, 0)
    }

    /// Parses an image whose header starts at `header_offset` of `buffer`.
    pub fn parse_at(buffer: &'a [u8], header_offset: usize) -> Result<Self> {
        let magic = u32::from_le_bytes(
            checked_range(buffer, header_offset, 4)?
                .try_into()
                .map_err(|_| Error::parse(header_offset, "short magic"))?,
        );

        let (header, is_64, header_size) = match magic {
            MH_MAGIC_64 => (
                read_struct::<MachHeader64>(buffer, header_offset)?,
                true,
                MachHeader64::SIZE,
            ),
            MH_MAGIC => (
                read_struct::<MachHeader32>(buffer, header_offset)?.into(),
                false,
                MachHeader32::SIZE,
            ),
            MH_CIGAM | MH_CIGAM_64 => return Err(Error::unsupported("big-endian Mach-O")),
            other => return Err(Error::InvalidMachoMagic(other)),
        };

        let mut image = Self {
            header,
            is_64,
            header_offset,
            load_commands: Vec::with_capacity(
                (header.ncmds as usize).min(header.sizeofcmds as usize / LoadCommand::SIZE),
            ),
            data: buffer,
            segment_indices: HashMap::new(),
        };

        image.parse_load_commands(header_offset + header_size)?;
        image.validate_layout()?;

        Ok(image)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, start: usize) -> Result<()> {
        let end = start
            .checked_add(self.header.sizeofcmds as usize)
            .ok_or(Error::LoadCommandOverflow { offset: start })?;
        checked_range(self.data, start, end - start)?;

        let mut offset = start;
        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = read_struct::<LoadCommand>(self.data, offset)?;
            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE {
                return Err(Error::parse(offset, format!("load command size {:#x}", cmdsize)));
            }
            if offset + cmdsize > end {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &self.data[offset..offset + cmdsize];
            let info = self.parse_load_command(lc, cmd_data, offset)?;

            if let LoadCommandInfo::Segment(ref seg) = info {
                self.segment_indices
                    .entry(seg.name().to_string())
                    .or_insert(self.load_commands.len());
            }

            self.load_commands.push(info);
            offset += cmdsize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(
        &self,
        lc: LoadCommand,
        data: &[u8],
        offset: usize,
    ) -> Result<LoadCommandInfo> {
        let info = match lc.cmd {
            LC_SEGMENT_64 | LC_SEGMENT => {
                let (command, seg_size, sect_size) = if lc.cmd == LC_SEGMENT_64 {
                    (
                        read_cmd::<SegmentCommand64>(data, 0, offset)?,
                        SegmentCommand64::SIZE,
                        Section64::SIZE,
                    )
                } else {
                    (
                        read_cmd::<SegmentCommand32>(data, 0, offset)?.into(),
                        SegmentCommand32::SIZE,
                        Section32::SIZE,
                    )
                };

                let nsects = command.nsects as usize;
                if nsects > data.len().saturating_sub(seg_size) / sect_size {
                    return Err(Error::parse(
                        offset,
                        format!("{} sections do not fit in segment command", nsects),
                    ));
                }
                let mut sections = Vec::with_capacity(nsects);
                for i in 0..nsects {
                    let sect_rel = seg_size + i * sect_size;
                    let section = if lc.cmd == LC_SEGMENT_64 {
                        read_cmd::<Section64>(data, sect_rel, offset)?
                    } else {
                        read_cmd::<Section32>(data, sect_rel, offset)?.into()
                    };
                    sections.push(SectionInfo {
                        section,
                        struct_offset: offset + sect_rel,
                    });
                }

                LoadCommandInfo::Segment(SegmentInfo {
                    command,
                    command_offset: offset,
                    sections,
                })
            }

            LC_SYMTAB => LoadCommandInfo::Symtab {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_DYSYMTAB => LoadCommandInfo::Dysymtab {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => LoadCommandInfo::DyldInfo {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_ATOM_INFO => LoadCommandInfo::LinkeditData {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let command: DylibCommand = read_cmd(data, 0, offset)?;
                LoadCommandInfo::Dylib {
                    name: command_string(data, command.dylib.name_offset),
                    command,
                    offset,
                }
            }

            LC_LOAD_DYLINKER | LC_ID_DYLINKER | LC_DYLD_ENVIRONMENT | LC_RPATH => {
                let command: StringCommand = read_cmd(data, 0, offset)?;
                LoadCommandInfo::Path {
                    cmd: lc.cmd,
                    cmdsize: lc.cmdsize,
                    path: command_string(data, command.name_offset),
                    offset,
                }
            }

            LC_UUID => LoadCommandInfo::Uuid {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_BUILD_VERSION => LoadCommandInfo::BuildVersion {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_SOURCE_VERSION => LoadCommandInfo::SourceVersion {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => LoadCommandInfo::EncryptionInfo {
                command: read_cmd(data, 0, offset)?,
                offset,
            },

            LC_FILESET_ENTRY => {
                let command: FilesetEntryCommand = read_cmd(data, 0, offset)?;
                LoadCommandInfo::FilesetEntry {
                    entry_id: command_string(data, command.entry_id_offset),
                    command,
                    offset,
                }
            }

            _ => LoadCommandInfo::Unknown {
                cmd: lc.cmd,
                cmdsize: lc.cmdsize,
                offset,
            },
        };

        Ok(info)
    }

    /// Checks that every segment lies within the buffer and every non-empty
    /// section lies within its segment's address range.
    fn validate_layout(&self) -> Result<()> {
        for seg in self.segments() {
            let cmd = &seg.command;
            if cmd.filesize > 0 {
                checked_range_u64(self.data, cmd.fileoff, cmd.filesize)?;
            }
            for sect in &seg.sections {
                let s = &sect.section;
                if s.size == 0 {
                    continue;
                }
                let end = s.addr.checked_add(s.size);
                let seg_end = cmd.vmaddr.checked_add(cmd.vmsize);
                let inside = match (end, seg_end) {
                    (Some(end), Some(seg_end)) => s.addr >= cmd.vmaddr && end <= seg_end,
                    _ => false,
                };
                if !inside {
                    return Err(Error::parse(
                        sect.struct_offset,
                        format!(
                            "section {} lies outside segment {}",
                            sect.full_name(),
                            seg.name()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns the buffer this image was parsed from.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a segment by name or a not-found error.
    pub fn require_segment(&self, name: &str) -> Result<&SegmentInfo> {
        self.segment(name).ok_or_else(|| Error::SegmentNotFound {
            name: name.to_string(),
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns all sections in load order.
    pub fn sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.segments().flat_map(|seg| seg.sections.iter())
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo> {
        self.segment(segment)?.section(section)
    }

    /// Returns the file contents of a section.
    pub fn section_data(&self, segment: &str, section: &str) -> Result<&'a [u8]> {
        let sect = self
            .section(segment, section)
            .ok_or_else(|| Error::SectionNotFound {
                segment: segment.to_string(),
                section: section.to_string(),
            })?;
        if sect.section.is_zerofill() {
            return Ok(&[]);
        }
        checked_range_u64(self.data, sect.section.offset as u64, sect.section.size)
    }

    /// Returns the file contents of a segment.
    pub fn segment_data(&self, name: &str) -> Result<&'a [u8]> {
        let seg = self.require_segment(name)?;
        checked_range_u64(self.data, seg.command.fileoff, seg.command.filesize)
    }

    /// Returns the __TEXT segment.
    pub fn text_segment(&self) -> Option<&SegmentInfo> {
        self.segment("__TEXT")
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Symtab { command, .. } => Some(command),
            _ => None,
        })
    }

    /// Returns the build version command.
    pub fn build_version(&self) -> Option<&BuildVersionCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::BuildVersion { command, .. } => Some(command),
            _ => None,
        })
    }

    /// Returns the image UUID.
    pub fn uuid(&self) -> Option<Uuid> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Uuid { command, .. } => Some(Uuid::from_bytes(command.uuid)),
            _ => None,
        })
    }

    /// Returns the raw LC_SOURCE_VERSION value.
    pub fn source_version(&self) -> Option<u64> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::SourceVersion { command, .. } => Some(command.version),
            _ => None,
        })
    }

    /// Returns the code signature location.
    pub fn code_signature(&self) -> Option<&LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::LinkeditData { command, .. } if command.cmd == LC_CODE_SIGNATURE => {
                Some(command)
            }
            _ => None,
        })
    }

    /// Returns an iterator over linked dylibs as (path, command).
    pub fn dylibs(&self) -> impl Iterator<Item = (&str, &DylibCommand)> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd != LC_ID_DYLIB => {
                Some((name.as_str(), command))
            }
            _ => None,
        })
    }

    /// Returns the entries of an `MH_FILESET` image.
    pub fn fileset_entries(&self) -> impl Iterator<Item = FilesetEntry> + '_ {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::FilesetEntry {
                command, entry_id, ..
            } => Some(FilesetEntry {
                entry_id: entry_id.clone(),
                vmaddr: command.vmaddr,
                fileoff: command.fileoff,
            }),
            _ => None,
        })
    }

    /// Parses the fileset entry with the given identifier.
    pub fn fileset_image(&self, entry_id: &str) -> Result<MachOImage<'a>> {
        let entry = self
            .fileset_entries()
            .find(|e| e.entry_id == entry_id)
            .ok_or_else(|| Error::not_found("fileset entry", entry_id))?;
        let offset = usize::try_from(entry.fileoff)
            .map_err(|_| Error::out_of_bounds(entry.fileoff, 0, self.data.len()))?;
        MachOImage::parse_at(self.data, offset)
    }

    /// Returns the header's architecture name.
    pub fn arch_name(&self) -> String {
        self.header.arch_name()
    }

    /// Converts a virtual address to a buffer offset.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        self.segments()
            .find(|seg| seg.command.contains_addr(addr))
            .and_then(|seg| {
                let delta = addr - seg.command.vmaddr;
                if delta >= seg.command.filesize {
                    return None;
                }
                usize::try_from(seg.command.fileoff + delta).ok()
            })
    }

    /// Converts a buffer offset to a virtual address.
    pub fn offset_to_addr(&self, offset: usize) -> Option<u64> {
        let offset = offset as u64;
        self.segments()
            .find(|seg| offset >= seg.command.fileoff && offset < seg.file_end())
            .map(|seg| seg.command.vmaddr + (offset - seg.command.fileoff))
    }

    /// Returns the segment and section names containing `addr`.
    pub fn section_for_addr(&self, addr: u64) -> Option<&SectionInfo> {
        self.sections().find(|s| {
            addr >= s.section.addr && addr - s.section.addr < s.section.size
        })
    }
}

/// Reads a record at `rel` within a load command. Errors report the command's
/// absolute offset.
fn read_cmd<T>(data: &[u8], rel: usize, offset: usize) -> Result<T>
where
    T: FromBytes + KnownLayout + Immutable,
{
    read_struct(data, rel).map_err(|_| Error::LoadCommandOverflow { offset })
}

/// Reads the NUL-terminated string at `name_offset` within a load command.
fn command_string(data: &[u8], name_offset: u32) -> String {
    data.get(name_offset as usize..)
        .map(fixed_str)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::*;

    #[test]
    fn test_parse_minimal_macho() {
        let data = simple_arm64(0x1000);
        let image = MachOImage::parse(&data).unwrap();

        assert!(image.is_64);
        assert!(image.header.is_arm64());
        assert_eq!(image.header.ncmds, 1);
        assert!(image.segment("__TEXT").is_some());
        assert_eq!(image.addr_to_offset(0x1_0000_0010), Some(0x10));
        assert_eq!(image.offset_to_addr(0x20), Some(0x1_0000_0020));
    }

    #[test]
    fn test_commands_and_lookups() {
        let data = MachOBuilder::arm64(MH_EXECUTE)
            .segment(
                "__TEXT",
                0x4000,
                0x1000,
                0,
                0x1000,
                &[sect("__text", 0x4800, 0x100, 0x800)],
            )
            .uuid([0x11; 16])
            .source_version(7195u64 << 40 | 81 << 30)
            .dylib("/usr/lib/libSystem.B.dylib", 0x0500_0000, 0x0001_0000)
            .code_signature(0x900, 0x100)
            .build(0x1000);
        let image = MachOImage::parse(&data).unwrap();

        assert_eq!(image.load_commands.len(), 5);
        assert_eq!(image.section_data("__TEXT", "__text").unwrap().len(), 0x100);
        assert_eq!(
            image.uuid().unwrap().to_string(),
            "11111111-1111-1111-1111-111111111111"
        );
        assert_eq!(image.source_version().map(format_source_version).unwrap(), "7195.81");
        let (path, _) = image.dylibs().next().unwrap();
        assert_eq!(path, "/usr/lib/libSystem.B.dylib");
        assert_eq!(image.code_signature().unwrap().dataoff, 0x900);
        assert_eq!(image.load_commands[0].name(), "LC_SEGMENT_64");
        assert_eq!(
            image.section_for_addr(0x4810).map(|s| s.full_name()).unwrap(),
            "__TEXT,__text"
        );
        assert!(matches!(
            image.section_data("__DATA", "__data"),
            Err(Error::SectionNotFound { .. })
        ));
    }

    #[test]
    fn test_parse_32bit_widens() {
        let data = MachOBuilder::new32(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, MH_EXECUTE)
            .segment("__TEXT", 0x4000, 0x1000, 0, 0x800, &[sect("__text", 0x4100, 0x40, 0x100)])
            .build(0x800);
        let image = MachOImage::parse(&data).unwrap();

        assert!(!image.is_64);
        assert_eq!(image.arch_name(), "armv7");
        let seg = image.segment("__TEXT").unwrap();
        assert_eq!(seg.command.vmaddr, 0x4000);
        assert_eq!(seg.command.filesize, 0x800);
        assert_eq!(seg.sections[0].section.offset, 0x100);
    }

    #[test]
    fn test_segment_outside_buffer() {
        let data = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", 0x4000, 0x2000, 0, 0x2000, &[])
            .build(0x1000);
        let err = MachOImage::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
    }

    #[test]
    fn test_section_outside_segment() {
        let data = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", 0x4000, 0x1000, 0, 0x1000, &[sect("__text", 0x8000, 0x10, 0)])
            .build(0x1000);
        let err = MachOImage::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_truncated_load_commands() {
        let data = simple_arm64(0x1000);
        let err = MachOImage::parse(&data[..0x40]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
    }

    #[test]
    fn test_huge_counts_are_errors() {
        let mut data = vec![0u8; 32];
        put_u32_le(&mut data, 0, MH_MAGIC_64);
        put_u32_le(&mut data, 4, CPU_TYPE_ARM64);
        put_u32_le(&mut data, 16, u32::MAX);
        assert!(MachOImage::parse(&data).is_err());

        // nsects of the first segment command
        let mut data = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", 0x4000, 0x1000, 0, 0x1000, &[])
            .build(0x1000);
        put_u32_le(&mut data, 32 + 64, u32::MAX);
        let err = MachOImage::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_big_endian_unsupported() {
        let mut data = simple_arm64(0x100);
        data[..4].copy_from_slice(&MH_CIGAM_64.to_le_bytes());
        let err = MachOImage::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_fileset_image() {
        let inner = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", 0xfffffff007004000, 0x1000, 0x1000, 0x1000, &[])
            .header_bytes();
        let mut data = MachOBuilder::arm64(MH_FILESET)
            .segment("__TEXT", 0xfffffff007000000, 0x1000, 0, 0x1000, &[])
            .fileset_entry(0xfffffff007004000, 0x1000, "com.apple.kernel")
            .build(0x2000);
        put_bytes(&mut data, 0x1000, &inner);

        let outer = MachOImage::parse(&data).unwrap();
        assert!(outer.header.is_fileset());
        let kernel = outer.fileset_image("com.apple.kernel").unwrap();
        assert_eq!(kernel.header_offset, 0x1000);
        assert_eq!(kernel.text_segment().unwrap().command.fileoff, 0x1000);
        assert!(outer.fileset_image("com.apple.missing").is_err());
    }
}
