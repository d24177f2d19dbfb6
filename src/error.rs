//! Error types for Mach-O and firmware decoding.
//!
//! Every variant belongs to one class of [`ErrorKind`]. Decoders that walk a
//! list of independent items (KEXTs, code-signature blobs, iBoot payloads)
//! record recoverable failures as [`ItemError`]s and keep going; anything that
//! prevents loading or selecting an image at all is fatal.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Format Errors ====================
    #[error("unrecognized file type (magic {magic:#010x})")]
    UnrecognizedFormat { magic: u32 },

    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("invalid FAT header: {reason}")]
    InvalidFat { reason: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("invalid code signature magic {magic:#010x} at offset {offset:#x}")]
    InvalidBlobMagic { magic: u32, offset: usize },

    #[error("failed to decompress payload at offset {offset:#x}: {reason}")]
    Decompress { offset: usize, reason: String },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    // ==================== Bounds Errors ====================
    #[error("read of {size:#x} bytes at offset {offset:#x} exceeds buffer of {len:#x} bytes")]
    OutOfBounds { offset: u64, size: u64, len: u64 },

    // ==================== Architecture Errors ====================
    #[error("architecture '{name}' not found (available: {})", .available.join(", "))]
    ArchNotFound { name: String, available: Vec<String> },

    #[error("file contains multiple architectures, select one of: {}", .available.join(", "))]
    AmbiguousArchitecture { available: Vec<String> },

    // ==================== Unsupported Errors ====================
    #[error("unsupported: {what}")]
    UnsupportedVariant { what: String },

    // ==================== Not Found Errors ====================
    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("load command {name} not found")]
    LoadCommandNotFound { name: &'static str },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
}

/// A specialized Result type for decoding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operating system I/O failure.
    Io,
    /// Unrecognized or malformed structure.
    Format,
    /// A computed offset or size falls outside the buffer.
    Bounds,
    /// Requested architecture is absent or was not disambiguated.
    Architecture,
    /// A recognized format branch that is not implemented.
    Unsupported,
    /// A named item is absent.
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "I/O error",
            ErrorKind::Format => "format error",
            ErrorKind::Bounds => "bounds error",
            ErrorKind::Architecture => "architecture error",
            ErrorKind::Unsupported => "unsupported variant",
            ErrorKind::NotFound => "not found",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::FileOpen { .. }
            | Error::MemoryMap { .. }
            | Error::FileWrite { .. } => ErrorKind::Io,
            Error::UnrecognizedFormat { .. }
            | Error::InvalidMachoMagic(_)
            | Error::InvalidFat { .. }
            | Error::LoadCommandOverflow { .. }
            | Error::InvalidBlobMagic { .. }
            | Error::Decompress { .. }
            | Error::Parse { .. } => ErrorKind::Format,
            Error::OutOfBounds { .. } => ErrorKind::Bounds,
            Error::ArchNotFound { .. } | Error::AmbiguousArchitecture { .. } => {
                ErrorKind::Architecture
            }
            Error::UnsupportedVariant { .. } => ErrorKind::Unsupported,
            Error::SegmentNotFound { .. }
            | Error::SectionNotFound { .. }
            | Error::LoadCommandNotFound { .. }
            | Error::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Returns true if this error indicates a recoverable condition.
    ///
    /// Recoverable errors are confined to one item of a larger scan and are
    /// reported while the scan continues. Failing to open, map or classify the
    /// input, or to pick an architecture, ends the invocation.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Io | ErrorKind::Architecture)
            && !matches!(self, Error::UnrecognizedFormat { .. })
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an out-of-bounds error.
    #[inline]
    pub fn out_of_bounds(offset: u64, size: u64, len: usize) -> Self {
        Error::OutOfBounds {
            offset,
            size,
            len: len as u64,
        }
    }

    /// Creates an unsupported-variant error.
    #[inline]
    pub fn unsupported(what: impl Into<String>) -> Self {
        Error::UnsupportedVariant { what: what.into() }
    }

    /// Creates a not-found error for a named item.
    #[inline]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// A recoverable failure attached to one entry of a scan.
#[derive(Debug)]
pub struct ItemError {
    /// Position of the entry within the scan.
    pub index: usize,
    /// What went wrong.
    pub error: Error,
}

impl ItemError {
    /// Creates a new item error.
    pub fn new(index: usize, error: Error) -> Self {
        Self { index, error }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry {}: {}", self.index, self.error)
    }
}
