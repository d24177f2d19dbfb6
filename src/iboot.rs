//! iBoot embedded firmware decoding.
//!
//! iBoot carries firmware for auxiliary processors (PMU, SMC and others) as
//! LZFSE streams bracketed by `bvx2` and `bvx$` markers. Newer images also
//! embed the PMU firmware uncompressed; it is found from a fixed instruction
//! signature and a pointer back from iBoot's own descriptor table.

use std::fmt;

use tracing::{debug, info, warn};

use crate::darwin::describe_device;
use crate::error::{Error, ItemError, Result};
use crate::util::{find_from, printable_at, text_until, ByteView};

/// Start of an LZFSE v2 block.
pub const LZFSE_BLOB_START: &[u8] = b"bvx2";
/// LZFSE end-of-stream marker.
pub const LZFSE_BLOB_END: &[u8] = b"bvx$";

const VERSION_MARKER: &[u8] = b"iBoot-";
const DEVICE_MARKER: &[u8] = b"iBoot for ";
const NAME_MARKER: &[u8] = b"Apple";
const PMU_NAME_MARKER: &[u8] = b"ApplePMU";
const MAX_NAME: usize = 64;

/// Offset of the major version digits in the iBoot header.
const MAJOR_VERSION_OFFSET: usize = 0x286;
/// Builds after this major version moved the base address slot.
const BASE_OFFSET_THRESHOLD: u32 = 5540;
const BASE_OFFSET_NEW: usize = 0x300;
const BASE_OFFSET_OLD: usize = 0x318;

/// Instruction pair found in the PMU firmware text.
const PMU_SIGNATURE: u64 = 0x6800_4812_0000_0000;
/// First word of the PMU firmware image.
const PMU_FIRMWARE_TOP: u32 = 0x2000_0101;

const ARM32_ENTRY: u32 = 0xea00_0006;
const ARM64_ENTRY: u32 = 0x1400_0081;

/// Instruction set of a payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadArch {
    Arm64,
    Arm32,
    Unknown,
}

impl PayloadArch {
    /// Guesses the architecture from the first instruction word.
    pub fn detect(data: &[u8]) -> Self {
        match ByteView::new(data).u32_le(0) {
            Ok(ARM32_ENTRY) => PayloadArch::Arm32,
            Ok(ARM64_ENTRY) => PayloadArch::Arm64,
            _ => PayloadArch::Unknown,
        }
    }
}

impl fmt::Display for PayloadArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadArch::Arm64 => "arm64",
            PayloadArch::Arm32 => "arm32",
            PayloadArch::Unknown => "unknown",
        })
    }
}

/// How a payload is stored in the image.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Lzfse,
    Pmu,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadKind::Lzfse => "LZFSE",
            PayloadKind::Pmu => "PMU",
        })
    }
}

/// A firmware image embedded in iBoot.
#[derive(Debug, Clone)]
pub struct IbootPayload {
    /// Position in the payload list
    pub index: usize,
    /// Storage kind
    pub kind: PayloadKind,
    /// Instruction set
    pub arch: PayloadArch,
    /// File offset of the first byte
    pub start: usize,
    /// File offset one past the last byte
    pub end: usize,
    /// iBoot address of the payload, PMU only
    pub address: Option<u64>,
    /// Name found in the payload
    pub name: Option<String>,
    /// Decompressed bytes for LZFSE payloads, raw bytes otherwise
    pub data: Vec<u8>,
}

impl IbootPayload {
    /// Stored size in bytes.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Name to write the payload under.
    pub fn output_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("payload_{}", self.index),
        }
    }
}

/// A decoded iBoot image.
#[derive(Debug)]
pub struct IbootImage<'a> {
    data: &'a [u8],
    /// `iBoot-` build string
    pub version: Option<String>,
    /// Board identifier from the `iBoot for` banner
    pub device: String,
    /// Major build number
    pub major: u32,
    /// Load address of the image
    pub base_address: u64,
    /// Embedded payloads in discovery order
    pub payloads: Vec<IbootPayload>,
    /// Payloads that failed to decode
    pub errors: Vec<ItemError>,
}

impl<'a> IbootImage<'a> {
    /// Decodes an iBoot image and its embedded payloads.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let view = ByteView::new(data);

        let device_at = view
            .find(DEVICE_MARKER, 0)
            .ok_or_else(|| Error::not_found("string", "iBoot for"))?;
        let device = text_until(data, device_at + DEVICE_MARKER.len(), b',')
            .ok_or_else(|| Error::parse(device_at, "unterminated device banner"))?;
        let version = view
            .find(VERSION_MARKER, 0)
            .and_then(|pos| printable_at(data, pos, MAX_NAME));

        let major = leading_number(view.bytes(MAJOR_VERSION_OFFSET, 8)?);
        let base_offset = if major > BASE_OFFSET_THRESHOLD {
            BASE_OFFSET_NEW
        } else {
            BASE_OFFSET_OLD
        };
        let base_address = view.u64_le(base_offset)?;
        info!(
            "iBoot {} for {}, base {:#x}",
            version.as_deref().unwrap_or("(unknown)"),
            describe_device(&device),
            base_address
        );

        let mut image = Self {
            data,
            version,
            device,
            major,
            base_address,
            payloads: Vec::new(),
            errors: Vec::new(),
        };
        image.scan_lzfse();
        image.scan_pmu();
        debug!("{} embedded payloads", image.payloads.len());
        Ok(image)
    }

    /// Returns the raw image bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Finds a payload by its output name.
    pub fn payload(&self, name: &str) -> Option<&IbootPayload> {
        self.payloads.iter().find(|p| p.output_name() == name)
    }

    fn next_index(&self) -> usize {
        self.payloads.len() + self.errors.len()
    }

    fn scan_lzfse(&mut self) {
        let data = self.data;
        let mut from = 0;
        while let Some(start) = find_from(data, LZFSE_BLOB_START, from) {
            let Some(end) = find_from(data, LZFSE_BLOB_END, start) else {
                debug!("LZFSE block at {:#x} has no end marker", start);
                break;
            };
            let stop = end + LZFSE_BLOB_END.len();
            let index = self.next_index();

            match decompress(&data[start..stop], start) {
                Ok(decompressed) => {
                    let name = find_from(&decompressed, NAME_MARKER, 0)
                        .and_then(|pos| printable_at(&decompressed, pos, MAX_NAME));
                    let arch = PayloadArch::detect(&decompressed);
                    debug!(
                        "payload {} at {:#x}: {} bytes -> {} bytes, {}",
                        index,
                        start,
                        stop - start,
                        decompressed.len(),
                        arch
                    );
                    self.payloads.push(IbootPayload {
                        index,
                        kind: PayloadKind::Lzfse,
                        arch,
                        start,
                        end: stop,
                        address: None,
                        name,
                        data: decompressed,
                    });
                }
                Err(e) => {
                    warn!("payload {}: {}", index, e);
                    self.errors.push(ItemError::new(index, e));
                }
            }
            from = stop;
        }
    }

    fn scan_pmu(&mut self) {
        let index = self.next_index();
        match self.find_pmu(index) {
            Ok(Some(payload)) => self.payloads.push(payload),
            Ok(None) => debug!("no PMU firmware"),
            Err(e) => {
                warn!("PMU firmware: {}", e);
                self.errors.push(ItemError::new(index, e));
            }
        }
    }

    fn find_pmu(&self, index: usize) -> Result<Option<IbootPayload>> {
        let view = ByteView::new(self.data);
        let Some(text) = view.find(&PMU_SIGNATURE.to_le_bytes(), 0) else {
            return Ok(None);
        };

        let mut pos = text + 4;
        let base = loop {
            if view.u32_le(pos)? == PMU_FIRMWARE_TOP {
                break pos.checked_sub(4);
            }
            match pos.checked_sub(4) {
                Some(prev) => pos = prev,
                None => break None,
            }
        }
        .ok_or_else(|| Error::parse(text, "PMU firmware start not found"))?;

        let address = base as u64 + self.base_address;
        let Some(desc) = view.find(&address.to_le_bytes(), 0) else {
            debug!("no descriptor for PMU firmware at {:#x}", address);
            return Ok(None);
        };
        // The newer descriptor repeats the address and stores the size
        // after four 64-bit fields.
        let size = if view.u64_le(desc)? == view.u64_le(desc + 8)? {
            view.u32_le(desc + 32)?
        } else {
            view.u32_le(desc + 8)?
        } as usize;

        let bytes = view.bytes(base, size)?;
        let name = find_from(bytes, PMU_NAME_MARKER, 0).and_then(|pos| printable_at(bytes, pos, MAX_NAME));
        debug!("PMU firmware at {:#x}, {:#x} bytes", base, size);

        Ok(Some(IbootPayload {
            index,
            kind: PayloadKind::Pmu,
            arch: PayloadArch::detect(bytes),
            start: base,
            end: base + size,
            address: Some(address),
            name,
            data: bytes.to_vec(),
        }))
    }
}

/// Decodes an iBoot image.
pub fn parse_iboot(data: &[u8]) -> Result<IbootImage<'_>> {
    IbootImage::parse(data)
}

fn decompress(block: &[u8], offset: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((block.len() - LZFSE_BLOB_END.len()) * 4);
    lzfse_rust::decode_bytes(block, &mut out).map_err(|e| Error::Decompress {
        offset,
        reason: e.to_string(),
    })?;
    if out.is_empty() {
        return Err(Error::Decompress {
            offset,
            reason: "empty output".into(),
        });
    }
    Ok(out)
}

fn leading_number(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |n, &b| n.saturating_mul(10).saturating_add((b - b'0') as u32))
}
