//! In-memory fixture builders shared by the unit tests.

use zerocopy::IntoBytes;

use crate::macho::*;
use crate::util::align_up;

pub fn put_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32_be(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn put_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// A section to emit inside a segment command.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
}

pub fn sect(name: &'static str, addr: u64, size: u64, offset: u32) -> SectionSpec {
    SectionSpec {
        name,
        addr,
        size,
        offset,
        flags: S_REGULAR,
    }
}

/// Builds a Mach-O header and load command stream.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    is_64: bool,
    commands: Vec<Vec<u8>>,
}

impl MachOBuilder {
    pub fn new(cputype: u32, cpusubtype: u32, filetype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
            filetype,
            is_64: true,
            commands: Vec::new(),
        }
    }

    pub fn new32(cputype: u32, cpusubtype: u32, filetype: u32) -> Self {
        Self {
            is_64: false,
            ..Self::new(cputype, cpusubtype, filetype)
        }
    }

    pub fn arm64(filetype: u32) -> Self {
        Self::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, filetype)
    }

    /// Appends a raw load command; `payload` follows the 8-byte cmd/cmdsize
    /// header and is padded to 8 bytes.
    pub fn command(mut self, cmd: u32, payload: &[u8]) -> Self {
        let size = align_up((8 + payload.len()) as u64, 8) as usize;
        let mut raw = vec![0u8; size];
        put_u32_le(&mut raw, 0, cmd);
        put_u32_le(&mut raw, 4, size as u32);
        raw[8..8 + payload.len()].copy_from_slice(payload);
        self.commands.push(raw);
        self
    }

    pub fn segment(
        mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        sections: &[SectionSpec],
    ) -> Self {
        let mut raw = Vec::new();
        if self.is_64 {
            let mut seg = SegmentCommand64::default();
            seg.set_name(name);
            seg.vmaddr = vmaddr;
            seg.vmsize = vmsize;
            seg.fileoff = fileoff;
            seg.filesize = filesize;
            seg.nsects = sections.len() as u32;
            seg.cmdsize = (SegmentCommand64::SIZE + sections.len() * Section64::SIZE) as u32;
            raw.extend_from_slice(seg.as_bytes());
            for spec in sections {
                let mut s = Section64::default();
                s.set_names(name, spec.name);
                s.addr = spec.addr;
                s.size = spec.size;
                s.offset = spec.offset;
                s.flags = spec.flags;
                raw.extend_from_slice(s.as_bytes());
            }
        } else {
            let cmdsize = SegmentCommand32::SIZE + sections.len() * Section32::SIZE;
            raw.resize(SegmentCommand32::SIZE, 0);
            put_u32_le(&mut raw, 0, LC_SEGMENT);
            put_u32_le(&mut raw, 4, cmdsize as u32);
            put_bytes(&mut raw, 8, name.as_bytes());
            put_u32_le(&mut raw, 24, vmaddr as u32);
            put_u32_le(&mut raw, 28, vmsize as u32);
            put_u32_le(&mut raw, 32, fileoff as u32);
            put_u32_le(&mut raw, 36, filesize as u32);
            put_u32_le(&mut raw, 48, sections.len() as u32);
            for spec in sections {
                let mut s = vec![0u8; Section32::SIZE];
                put_bytes(&mut s, 0, spec.name.as_bytes());
                put_bytes(&mut s, 16, name.as_bytes());
                put_u32_le(&mut s, 32, spec.addr as u32);
                put_u32_le(&mut s, 36, spec.size as u32);
                put_u32_le(&mut s, 40, spec.offset);
                put_u32_le(&mut s, 56, spec.flags);
                raw.extend_from_slice(&s);
            }
        }
        self.commands.push(raw);
        self
    }

    pub fn uuid(self, uuid: [u8; 16]) -> Self {
        self.command(LC_UUID, &uuid)
    }

    pub fn build_version(self, platform: u32) -> Self {
        let mut payload = [0u8; 16];
        put_u32_le(&mut payload, 0, platform);
        put_u32_le(&mut payload, 4, 0x000f_0000);
        put_u32_le(&mut payload, 8, 0x000f_0000);
        self.command(LC_BUILD_VERSION, &payload)
    }

    pub fn source_version(self, version: u64) -> Self {
        self.command(LC_SOURCE_VERSION, &version.to_le_bytes())
    }

    pub fn fileset_entry(self, vmaddr: u64, fileoff: u64, id: &str) -> Self {
        let mut payload = vec![0u8; 24];
        put_u64_le(&mut payload, 0, vmaddr);
        put_u64_le(&mut payload, 8, fileoff);
        put_u32_le(&mut payload, 16, 32);
        payload.extend_from_slice(id.as_bytes());
        payload.push(0);
        self.command(LC_FILESET_ENTRY, &payload)
    }

    pub fn code_signature(self, dataoff: u32, datasize: u32) -> Self {
        let mut payload = [0u8; 8];
        put_u32_le(&mut payload, 0, dataoff);
        put_u32_le(&mut payload, 4, datasize);
        self.command(LC_CODE_SIGNATURE, &payload)
    }

    pub fn symtab(self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let mut payload = [0u8; 16];
        put_u32_le(&mut payload, 0, symoff);
        put_u32_le(&mut payload, 4, nsyms);
        put_u32_le(&mut payload, 8, stroff);
        put_u32_le(&mut payload, 12, strsize);
        self.command(LC_SYMTAB, &payload)
    }

    pub fn dylib(self, path: &str, current: u32, compat: u32) -> Self {
        let mut payload = vec![0u8; 16];
        put_u32_le(&mut payload, 0, 24);
        put_u32_le(&mut payload, 8, current);
        put_u32_le(&mut payload, 12, compat);
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        self.command(LC_LOAD_DYLIB, &payload)
    }

    /// Header plus load commands.
    pub fn header_bytes(&self) -> Vec<u8> {
        let sizeofcmds: usize = self.commands.iter().map(Vec::len).sum();
        let mut out = Vec::new();
        if self.is_64 {
            let header = MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
                reserved: 0,
            };
            out.extend_from_slice(header.as_bytes());
        } else {
            let header = MachHeader32 {
                magic: MH_MAGIC,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
            };
            out.extend_from_slice(header.as_bytes());
        }
        for cmd in &self.commands {
            out.extend_from_slice(cmd);
        }
        out
    }

    /// Writes the header at `offset` of `buf`.
    pub fn write_into(&self, buf: &mut [u8], offset: usize) {
        put_bytes(buf, offset, &self.header_bytes());
    }

    /// A zero-filled buffer of `len` bytes with the header at offset 0.
    pub fn build(&self, len: usize) -> Vec<u8> {
        let header = self.header_bytes();
        let mut buf = vec![0u8; len.max(header.len())];
        put_bytes(&mut buf, 0, &header);
        buf
    }
}

/// Builds a FAT archive from (cputype, cpusubtype, image) slices, each
/// aligned to 0x1000.
pub fn fat(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut buf = vec![0u8; 0x1000];
    put_u32_be(&mut buf, 0, FAT_MAGIC);
    put_u32_be(&mut buf, 4, slices.len() as u32);
    let mut offset = 0x1000usize;
    for (i, (cputype, cpusubtype, image)) in slices.iter().enumerate() {
        let entry = 8 + i * 20;
        put_u32_be(&mut buf, entry, *cputype);
        put_u32_be(&mut buf, entry + 4, *cpusubtype);
        put_u32_be(&mut buf, entry + 8, offset as u32);
        put_u32_be(&mut buf, entry + 12, image.len() as u32);
        put_u32_be(&mut buf, entry + 16, 12);
        buf.resize(offset, 0);
        buf.extend_from_slice(image);
        offset = align_up(buf.len() as u64, 0x1000) as usize;
    }
    buf
}

/// A small arm64 executable with a `__TEXT` segment covering `len` bytes.
pub fn simple_arm64(len: usize) -> Vec<u8> {
    MachOBuilder::arm64(MH_EXECUTE)
        .segment("__TEXT", 0x1_0000_0000, len as u64, 0, len as u64, &[])
        .build(len)
}

/// One KEXT dictionary of a split-style prelink plist.
pub fn plist_entry(name: &str, id: &str, addr: &str) -> String {
    format!(
        "<dict><key>CFBundleName</key><string>{name}</string>\
         <key>CFBundleIdentifier</key><string>{id}</string>\
         <key>_PrelinkExecutableLoadAddr</key><integer size=\"64\">{addr}</integer></dict>"
    )
}

/// A CodeDirectory blob carrying every field group its version allows.
/// Special slot `i` hashes to `[i; 32]` and code slot `j` to `[0xa0 + j; 32]`.
pub fn code_directory_blob(version: u32, identifier: &str, n_special: u32, n_code: u32) -> Vec<u8> {
    let header_len: usize = match version {
        v if v >= 0x20600 => 108,
        v if v >= 0x20500 => 96,
        v if v >= 0x20400 => 88,
        v if v >= 0x20300 => 64,
        v if v >= 0x20200 => 52,
        v if v >= 0x20100 => 48,
        _ => 44,
    };
    let ident_offset = header_len;
    let hash_offset = ident_offset + identifier.len() + 1 + n_special as usize * 32;
    let total = hash_offset + n_code as usize * 32;

    let mut buf = vec![0u8; total];
    for (i, v) in [
        0xfade0c02,
        total as u32,
        version,
        0x0002_0002,
        hash_offset as u32,
        ident_offset as u32,
        n_special,
        n_code,
        0x4000,
    ]
    .into_iter()
    .enumerate()
    {
        put_u32_be(&mut buf, i * 4, v);
    }
    buf[36] = 32;
    buf[37] = 2;
    buf[38] = 0;
    buf[39] = 12;
    if version >= 0x20400 {
        put_u32_be(&mut buf, 76, 0x4000);
        put_u32_be(&mut buf, 84, 1);
    }
    if version >= 0x20500 {
        put_u32_be(&mut buf, 88, 0x000d_0000);
    }
    if version >= 0x20600 {
        buf[96] = 2;
    }

    put_bytes(&mut buf, ident_offset, identifier.as_bytes());
    for i in 1..=n_special as usize {
        put_bytes(&mut buf, hash_offset - i * 32, &[i as u8; 32]);
    }
    for j in 0..n_code as usize {
        put_bytes(&mut buf, hash_offset + j * 32, &[0xa0 + j as u8; 32]);
    }
    buf
}

/// An embedded-signature SuperBlob holding `(slot type, blob)` entries.
pub fn superblob(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut offset = 12 + entries.len() * 8;
    let mut buf = vec![0u8; offset];
    put_u32_be(&mut buf, 0, 0xfade0cc0);
    put_u32_be(&mut buf, 8, entries.len() as u32);
    for (i, (slot, blob)) in entries.iter().enumerate() {
        put_u32_be(&mut buf, 12 + i * 8, *slot);
        put_u32_be(&mut buf, 16 + i * 8, offset as u32);
        buf.extend_from_slice(blob);
        offset += blob.len();
    }
    let len = buf.len() as u32;
    put_u32_be(&mut buf, 4, len);
    buf
}

/// A generic `magic, length, payload` blob.
pub fn generic_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    put_u32_be(&mut buf, 0, magic);
    put_u32_be(&mut buf, 4, (8 + payload.len()) as u32);
    buf.extend_from_slice(payload);
    buf
}
