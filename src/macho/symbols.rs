//! nm-style symbol table decoding.

use super::constants::*;
use super::context::MachOImage;
use super::names::stab_name;
use super::structs::{Nlist32, Nlist64};
use crate::error::Result;
use crate::util::{checked_range, fixed_str, read_struct};

/// A decoded symbol table entry.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name from the string table
    pub name: String,
    /// Symbol value (usually an address)
    pub value: u64,
    /// Raw `n_type`
    pub n_type: u8,
    /// Section ordinal (1-based) or NO_SECT
    pub n_sect: u8,
    /// Raw `n_desc`
    pub n_desc: u16,
}

impl Symbol {
    /// Returns true for debugger (stab) entries.
    #[inline]
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    /// Returns true for external symbols.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    /// Returns true for undefined symbols.
    #[inline]
    pub fn is_undefined(&self) -> bool {
        !self.is_stab() && self.n_type & N_TYPE == N_UNDF
    }

    /// Returns the stab name for debugger entries.
    pub fn stab_name(&self) -> Option<&'static str> {
        if self.is_stab() {
            stab_name(self.n_type)
        } else {
            None
        }
    }

    /// Returns the nm type letter. Uppercase marks external symbols.
    pub fn type_char(&self, image: &MachOImage<'_>) -> char {
        if self.is_stab() {
            return '-';
        }
        let c = match self.n_type & N_TYPE {
            N_UNDF | N_PBUD => 'u',
            N_ABS => 'a',
            N_INDR => 'i',
            N_SECT => self.section_char(image),
            _ => '?',
        };
        if self.is_external() {
            c.to_ascii_uppercase()
        } else {
            c
        }
    }

    fn section_char(&self, image: &MachOImage<'_>) -> char {
        if self.n_sect == NO_SECT {
            return 's';
        }
        match image.sections().nth(self.n_sect as usize - 1) {
            Some(s) => match (s.section.segment_name(), s.name()) {
                ("__TEXT", "__text") => 't',
                ("__DATA", "__data") => 'd',
                ("__DATA", "__bss") => 'b',
                _ => 's',
            },
            None => 's',
        }
    }
}

/// Reads every entry of the image's LC_SYMTAB.
///
/// Returns an empty list for images without a symbol table. Entries whose
/// string index falls outside the string table get an empty name.
pub fn read_symbols(image: &MachOImage<'_>) -> Result<Vec<Symbol>> {
    let Some(symtab) = image.symtab() else {
        return Ok(Vec::new());
    };
    let data = image.data();
    let entry_size = if image.is_64 {
        std::mem::size_of::<Nlist64>()
    } else {
        std::mem::size_of::<Nlist32>()
    };
    let table = checked_range(
        data,
        symtab.symoff as usize,
        symtab.nsyms as usize * entry_size,
    )?;
    let strings = checked_range(data, symtab.stroff as usize, symtab.strsize as usize)?;

    let mut symbols = Vec::with_capacity(symtab.nsyms as usize);
    for i in 0..symtab.nsyms as usize {
        let nlist = if image.is_64 {
            read_struct::<Nlist64>(table, i * entry_size)?
        } else {
            read_struct::<Nlist32>(table, i * entry_size)?.into()
        };
        let name = strings
            .get(nlist.n_strx as usize..)
            .map(fixed_str)
            .unwrap_or_default();
        symbols.push(Symbol {
            name,
            value: nlist.n_value,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect,
            n_desc: nlist.n_desc,
        });
    }
    Ok(symbols)
}
