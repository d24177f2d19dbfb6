//! Mach-O file format handling.
//!
//! This module provides the on-disk records, a borrowed [`MachOImage`] view,
//! name tables and symbol decoding for Mach-O images, the executable format
//! used on macOS and iOS.

mod constants;
mod context;
mod names;
mod structs;
mod symbols;

pub use constants::*;
pub use context::*;
pub use names::*;
pub use structs::*;
pub use symbols::*;
