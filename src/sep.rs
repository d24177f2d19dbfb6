//! Secure Enclave firmware decoding.
//!
//! SEPOS images are tagged `Built by legion2`. The 64-bit value that follows
//! the tag selects the layout:
//!
//! - zero: a 32-bit image that is a plain concatenation of Mach-O files
//!   (bootloader, kernel, then the apps), recovered by probing;
//! - above `0xf0fff`: a compressed image that cannot be decoded;
//! - anything else: the offset of a 64-bit header describing the kernel
//!   and the SEPOS init process.
//!
//! SEPROM images only carry a version banner.

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::macho::{LC_SEGMENT, LC_SEGMENT_64, MH_MAGIC};
use crate::util::{fixed_str, printable_at, ByteView};

const SEPOS_MARKER: &[u8] = b"Built by legion2";
const SEPROM_MARKER: &[u8] = b"AppleSEPROM-";
const PRIVATE_BUILD_MARKER: &[u8] = b"private_build..";
const SEPOS_VERSION_MARKER: &[u8] = b"AppleSEPOS-";

/// Header offsets above this value mark a compressed image.
const COMPRESSED_THRESHOLD: u64 = 0xf0fff;
/// Smallest region accepted as an embedded Mach-O.
const MIN_MACHO_SIZE: usize = 1024;
const MAX_BANNER: usize = 128;

/// Markers naming the apps of a 32-bit image, in search order.
const APP_MARKERS: [&[u8]; 3] = [b"AppleCredentialManager-", b"AppleKeyStore-", b"Mesa-605.100.11"];

// Field offsets of the 64-bit header.
const HDR64_KERNEL_UUID: usize = 0;
const HDR64_KERNEL_BASE: usize = 24;
const HDR64_KERNEL_MAX: usize = 32;
const HDR64_INIT_BASE: usize = 88;
const HDR64_INIT_NAME: usize = 144;
const HDR64_INIT_UUID: usize = 160;
const HDR64_N_APPS: usize = 192;

/// Layout of a SEP firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SepKind {
    /// Boot ROM
    Rom,
    /// 32-bit SEPOS
    Os32,
    /// Compressed 32-bit SEPOS
    Os32Compressed,
    /// 64-bit SEPOS
    Os64,
}

impl fmt::Display for SepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SepKind::Rom => "SEPROM",
            SepKind::Os32 => "SEPOS (32-bit)",
            SepKind::Os32Compressed => "SEPOS (compressed)",
            SepKind::Os64 => "SEPOS (64-bit)",
        })
    }
}

/// A region of the image holding one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SepRegion {
    /// Position among all regions of the image
    pub index: usize,
    /// Component name
    pub name: String,
    /// Component version, when the image names one
    pub version: Option<String>,
    /// File offset
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
    /// Image UUID from the 64-bit header
    pub uuid: Option<Uuid>,
}

impl SepRegion {
    fn new(index: usize, name: impl Into<String>, offset: usize, size: usize) -> Self {
        Self {
            index,
            name: name.into(),
            version: None,
            offset,
            size,
            uuid: None,
        }
    }

    /// Name to write the region under.
    pub fn output_name(&self) -> String {
        format!("sepdump{:02}_{}", self.index, self.name)
    }
}

/// A decoded SEP firmware image.
#[derive(Debug)]
pub struct SepFirmware<'a> {
    data: &'a [u8],
    /// Image layout
    pub kind: SepKind,
    /// SEPOS or SEPROM version banner
    pub version: Option<String>,
    /// Builder named by a private SEPROM build
    pub rom_builder: Option<String>,
    /// Value following the SEPOS tag
    pub header_offset: u64,
    /// Bootloader region
    pub bootloader: Option<SepRegion>,
    /// Kernel region
    pub kernel: Option<SepRegion>,
    /// SEPOS init process, 64-bit images only
    pub init: Option<SepRegion>,
    /// App count declared by the 64-bit header
    pub declared_apps: Option<u64>,
    apps: Vec<SepRegion>,
}

impl<'a> SepFirmware<'a> {
    /// Classifies and decodes a SEP image.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let view = ByteView::new(data);
        let mut sep = Self {
            data,
            kind: SepKind::Rom,
            version: None,
            rom_builder: None,
            header_offset: 0,
            bootloader: None,
            kernel: None,
            init: None,
            declared_apps: None,
            apps: Vec::new(),
        };

        let Some(tag) = view.find(SEPOS_MARKER, 0) else {
            sep.parse_rom()?;
            return Ok(sep);
        };

        sep.header_offset = view.u64_le(tag + SEPOS_MARKER.len())?;
        sep.version = view
            .find(SEPOS_VERSION_MARKER, 0)
            .and_then(|pos| printable_at(data, pos, MAX_BANNER));

        if sep.header_offset > COMPRESSED_THRESHOLD {
            sep.kind = SepKind::Os32Compressed;
            warn!(
                "compressed SEPOS firmware is not supported (header offset {:#x})",
                sep.header_offset
            );
        } else if sep.header_offset == 0 {
            sep.kind = SepKind::Os32;
            sep.probe_32();
        } else {
            sep.kind = SepKind::Os64;
            sep.parse_64(sep.header_offset as usize)?;
            warn!("64-bit SEPOS apps cannot be enumerated");
        }
        info!(
            "{} {}",
            sep.kind,
            sep.version.as_deref().unwrap_or("(unknown version)")
        );
        Ok(sep)
    }

    /// Returns the raw image bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the apps of a 32-bit image.
    ///
    /// Fails for layouts whose app tables are not understood.
    pub fn apps(&self) -> Result<&[SepRegion]> {
        match self.kind {
            SepKind::Os32 | SepKind::Rom => Ok(&self.apps),
            SepKind::Os64 => Err(Error::unsupported("64-bit SEPOS app enumeration")),
            SepKind::Os32Compressed => Err(Error::unsupported("compressed SEPOS firmware")),
        }
    }

    /// Returns every located region in file order.
    pub fn regions(&self) -> Vec<&SepRegion> {
        let mut regions: Vec<&SepRegion> = [&self.bootloader, &self.kernel, &self.init]
            .into_iter()
            .flatten()
            .chain(&self.apps)
            .collect();
        regions.sort_by_key(|r| r.index);
        regions
    }

    /// Returns the bytes of a region.
    pub fn region_data(&self, region: &SepRegion) -> Result<&'a [u8]> {
        ByteView::new(self.data).bytes(region.offset, region.size)
    }

    fn parse_rom(&mut self) -> Result<()> {
        let view = ByteView::new(self.data);
        if let Some(pos) = view.find(SEPROM_MARKER, 0) {
            self.version = printable_at(self.data, pos, MAX_BANNER);
        } else if let Some(pos) = view.find(PRIVATE_BUILD_MARKER, 0) {
            self.version = Some("private_build".into());
            self.rom_builder = printable_at(self.data, pos, MAX_BANNER).and_then(|line| {
                let (_, rest) = line.split_once('(')?;
                let (builder, _) = rest.split_once(')')?;
                Some(builder.to_string())
            });
        } else {
            return Err(Error::not_found("string", "SEP firmware marker"));
        }
        Ok(())
    }

    /// Walks the image in 4-byte steps, taking each embedded Mach-O in turn
    /// as the bootloader, the kernel and then the apps.
    fn probe_32(&mut self) {
        let data = self.data;
        let mut index = 0;
        let mut pos = 0;
        while pos < data.len() {
            let Some(size) = macho_extent(&data[pos..]) else {
                pos += 4;
                continue;
            };
            debug!("Mach-O at {:#x}, {:#x} bytes", pos, size);

            match index {
                0 => {
                    let mut region = SepRegion::new(index, "bootloader", pos, size);
                    region.version = self.version.clone();
                    self.bootloader = Some(region);
                }
                1 => {
                    let mut region = SepRegion::new(index, "kernel", pos, size);
                    region.version = self.version.clone();
                    self.kernel = Some(region);
                }
                _ => {
                    let (name, version) = app_identity(&data[pos..pos + size]);
                    let mut region = SepRegion::new(index, name, pos, size);
                    region.version = Some(version);
                    self.apps.push(region);
                }
            }
            index += 1;
            pos += size.max(4);
        }
    }

    fn parse_64(&mut self, hdr: usize) -> Result<()> {
        let view = ByteView::new(self.data);
        let uuid_at = |off: usize| -> Result<Uuid> {
            let bytes: [u8; 16] = view
                .bytes(hdr + off, 16)?
                .try_into()
                .map_err(|_| Error::parse(hdr + off, "short UUID"))?;
            Ok(Uuid::from_bytes_le(bytes))
        };

        let kernel_base = view.u64_le(hdr + HDR64_KERNEL_BASE)? as usize;
        let kernel_max = view.u64_le(hdr + HDR64_KERNEL_MAX)? as usize;
        let init_base = view.u64_le(hdr + HDR64_INIT_BASE)? as usize;
        let init_name = fixed_str(view.bytes(hdr + HDR64_INIT_NAME, 16)?)
            .trim()
            .to_string();
        self.declared_apps = Some(view.u64_le(hdr + HDR64_N_APPS)?);

        view.bytes(0, kernel_base)?;
        self.bootloader = Some(SepRegion::new(0, "boot", 0, kernel_base));

        let kernel_size = match view.tail(kernel_base).ok().and_then(|t| macho_extent(t.as_slice())) {
            Some(size) => size,
            None => kernel_max
                .checked_sub(kernel_base)
                .ok_or_else(|| Error::parse(hdr + HDR64_KERNEL_MAX, "kernel ends before it starts"))?,
        };
        view.bytes(kernel_base, kernel_size)?;
        let mut kernel = SepRegion::new(1, "kernel", kernel_base, kernel_size);
        kernel.uuid = Some(uuid_at(HDR64_KERNEL_UUID)?);
        kernel.version = self.version.clone();
        self.kernel = Some(kernel);

        let init_size = macho_extent(view.tail(init_base)?.as_slice())
            .ok_or_else(|| Error::parse(init_base, "no Mach-O at SEPOS init base"))?;
        let mut init = SepRegion::new(2, init_name, init_base, init_size);
        init.uuid = Some(uuid_at(HDR64_INIT_UUID)?);
        self.init = Some(init);
        Ok(())
    }
}

/// Decodes a SEP firmware image.
pub fn parse_sep(data: &[u8]) -> Result<SepFirmware<'_>> {
    SepFirmware::parse(data)
}

/// Returns the extent of a Mach-O at the start of `data`, computed as the
/// furthest segment end, if it is at least [`MIN_MACHO_SIZE`] bytes long and
/// fits the buffer.
fn macho_extent(data: &[u8]) -> Option<usize> {
    if data.len() < MIN_MACHO_SIZE {
        return None;
    }
    let view = ByteView::new(data);
    let magic = view.u32_le(0).ok()?;
    if magic & !1 != MH_MAGIC {
        return None;
    }
    let ncmds = view.u32_le(16).ok()?;
    let mut pos = if magic & 1 == 1 { 32 } else { 28 };

    let mut extent = 0u64;
    for _ in 0..ncmds {
        let cmd = view.u32_le(pos).ok()?;
        let cmdsize = view.u32_le(pos + 4).ok()? as usize;
        let end = match cmd {
            LC_SEGMENT => view.u32_le(pos + 32).ok()? as u64 + view.u32_le(pos + 36).ok()? as u64,
            LC_SEGMENT_64 => view.u64_le(pos + 40).ok()?.checked_add(view.u64_le(pos + 48).ok()?)?,
            _ => 0,
        };
        extent = extent.max(end);
        if cmdsize == 0 {
            break;
        }
        pos += cmdsize;
    }

    let extent = usize::try_from(extent).ok()?;
    (extent != 0 && extent <= data.len()).then_some(extent)
}

/// Reads the `Name-version/...` banner of a 32-bit app.
fn app_identity(region: &[u8]) -> (String, String) {
    let view = ByteView::new(region);
    APP_MARKERS
        .iter()
        .find_map(|marker| view.find(marker, 0))
        .and_then(|pos| printable_at(region, pos, MAX_BANNER))
        .and_then(|banner| {
            let (name, rest) = banner.split_once('-')?;
            let version = rest.split('/').next().unwrap_or(rest);
            Some((name.to_string(), version.to_string()))
        })
        .unwrap_or_else(|| ("Unknown".into(), "000.0.0".into()))
}
