//! machscope - Mach-O and Darwin firmware analysis.
//!
//! This library decodes Mach-O images and the firmware Apple builds from
//! them: XNU kernelcaches with their embedded KEXTs, iBoot with its embedded
//! coprocessor firmware, and Secure Enclave images.
//!
//! # Features
//!
//! - Memory-mapped, zero-copy decoding with bounds-checked reads
//! - FAT/universal archives with explicit architecture selection
//! - Kernelcache layout detection and KEXT extraction for split, merged and
//!   fileset kernels
//! - Code signature decoding (CodeDirectory, requirements, CMS)
//! - iBoot LZFSE payload and PMU firmware recovery
//! - SEPOS and SEPROM decoding
//!
//! # Example
//!
//! ```no_run
//! use machscope::{load_and_classify, Firmware};
//!
//! fn main() -> machscope::Result<()> {
//!     let (file, _container) = load_and_classify("/path/to/kernelcache")?;
//!
//!     if let Some(firmware) = Firmware::parse(file.data())? {
//!         for name in firmware.artifact_names()? {
//!             let bytes = firmware.extract(&name)?;
//!             std::fs::write(&name, bytes)?;
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codesign;
pub mod container;
pub mod darwin;
pub mod error;
pub mod iboot;
pub mod loader;
pub mod macho;
pub mod sep;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use codesign::{decode_code_signature, CodeSignature};
pub use container::Container;
pub use darwin::{parse_kernel, resolve_firmware_kind, FirmwareKind, KernelImage};
pub use error::{Error, ErrorKind, ItemError, Result};
pub use iboot::{parse_iboot, IbootImage};
pub use loader::{load_and_classify, select_architecture, LoadedFile};
pub use macho::MachOImage;
pub use sep::{parse_sep, SepFirmware};

use std::path::PathBuf;

use tracing::debug;

/// What the `macho` command prints.
#[derive(Debug, Clone, Default)]
pub struct MachoOptions {
    /// Architecture to select from a FAT archive
    pub arch: Option<String>,
    /// Print the header
    pub header: bool,
    /// Print load commands
    pub load_commands: bool,
    /// Print linked libraries
    pub libraries: bool,
    /// Print the symbol table
    pub symbols: bool,
    /// Print the code signature
    pub code_signature: bool,
}

impl MachoOptions {
    /// Turns every section on.
    pub fn all(mut self) -> Self {
        self.header = true;
        self.load_commands = true;
        self.libraries = true;
        self.symbols = true;
        self.code_signature = true;
        self
    }

    /// Returns true if no section was requested.
    pub fn is_empty(&self) -> bool {
        !(self.header || self.load_commands || self.libraries || self.symbols || self.code_signature)
    }
}

/// Options for firmware analysis.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Architecture to select from a FAT archive
    pub arch: Option<String>,
    /// List embedded components
    pub list: bool,
    /// Component to extract
    pub extract: Option<String>,
    /// Extract every component
    pub extract_all: bool,
    /// Dump the Mach trap table
    pub traps: bool,
    /// Directory extracted files are written to
    pub output_dir: PathBuf,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            arch: None,
            list: false,
            extract: None,
            extract_all: false,
            traps: false,
            output_dir: PathBuf::from("extracted"),
        }
    }
}

/// An extractable component of a firmware image.
#[derive(Debug)]
pub struct Artifact<'s> {
    /// Output file name
    pub name: String,
    /// Component bytes
    pub data: Result<&'s [u8]>,
}

/// A decoded firmware component.
#[derive(Debug)]
pub enum Firmware<'a> {
    /// XNU kernelcache
    Kernel(KernelImage<'a>),
    /// iBoot
    Iboot(IbootImage<'a>),
    /// Secure Enclave firmware
    Sep(SepFirmware<'a>),
}

impl<'a> Firmware<'a> {
    /// Classifies and decodes `data`. Returns `None` if it is not a known
    /// firmware component.
    pub fn parse(data: &'a [u8]) -> Result<Option<Self>> {
        let Some(kind) = resolve_firmware_kind(data) else {
            return Ok(None);
        };
        debug!("decoding {}", kind);
        let firmware = match kind {
            FirmwareKind::Kernel => Firmware::Kernel(parse_kernel(data)?),
            FirmwareKind::Iboot => Firmware::Iboot(parse_iboot(data)?),
            FirmwareKind::Sep => Firmware::Sep(parse_sep(data)?),
        };
        Ok(Some(firmware))
    }

    /// Returns the component kind.
    pub fn kind(&self) -> FirmwareKind {
        match self {
            Firmware::Kernel(_) => FirmwareKind::Kernel,
            Firmware::Iboot(_) => FirmwareKind::Iboot,
            Firmware::Sep(_) => FirmwareKind::Sep,
        }
    }

    /// Returns every embedded component in file order.
    ///
    /// A component whose bytes fall outside the image carries the error in
    /// place of its data, so one bad record does not hide the rest.
    pub fn artifacts(&self) -> Result<Vec<Artifact<'_>>> {
        Ok(match self {
            Firmware::Kernel(kernel) => kernel
                .kexts()?
                .kexts
                .into_iter()
                .map(|k| Artifact {
                    data: kernel.kext_bytes(&k),
                    name: k.name,
                })
                .collect(),
            Firmware::Iboot(iboot) => iboot
                .payloads
                .iter()
                .map(|p| Artifact {
                    name: p.output_name(),
                    data: Ok(&p.data),
                })
                .collect(),
            Firmware::Sep(sep) => sep
                .regions()
                .into_iter()
                .map(|r| Artifact {
                    name: r.output_name(),
                    data: sep.region_data(r),
                })
                .collect(),
        })
    }

    /// Names under which embedded components can be extracted.
    pub fn artifact_names(&self) -> Result<Vec<String>> {
        Ok(self.artifacts()?.into_iter().map(|a| a.name).collect())
    }

    /// Copies out the component with the given name.
    ///
    /// SEP regions also match by their bare component name.
    pub fn extract(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            Firmware::Kernel(kernel) => kernel.extract_kext(name),
            Firmware::Iboot(iboot) => iboot
                .payload(name)
                .map(|p| p.data.clone())
                .ok_or_else(|| Error::not_found("payload", name)),
            Firmware::Sep(sep) => {
                let regions = sep.regions();
                let region = regions
                    .iter()
                    .find(|r| r.output_name() == name)
                    .or_else(|| regions.iter().find(|r| r.name == name))
                    .ok_or_else(|| Error::not_found("SEP region", name))?;
                Ok(sep.region_data(region)?.to_vec())
            }
        }
    }
}
