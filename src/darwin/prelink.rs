//! Text scanner for the `__PRELINK_INFO` property list of split-style
//! kernelcaches.
//!
//! The plist maps every embedded KEXT to the kernel address its header was
//! loaded at. Only three keys matter, so the scanner walks the raw text with
//! substring searches instead of parsing XML. Each step finds the next
//! `CFBundleName` key, the `_PrelinkExecutableLoadAddr` that follows it and
//! the bundle identifier of the same dictionary.

use tracing::warn;

use crate::error::{Error, Result};
use crate::util::{contains, find_from, find_within};

/// Marks a plist that carries the KEXT load-address map.
const MAP_MARKER: &[u8] = b"PrelinkExecutableLoa";
const BUNDLE_NAME_KEY: &[u8] = b"CFBundleName</key>";
const BUNDLE_ID_KEY: &[u8] = b"CFBundleIdentifier";
const LOAD_ADDR_KEY: &[u8] = b"_PrelinkExecutableLoadAddr";
const STRING_END: &[u8] = b"</string>";
const ID_ATTR: &[u8] = b"ID=\"";
const ID_ATTR_END: &[u8] = b"\">";

/// Length of `CFBundleName</key><string>`.
const BUNDLE_NAME_VALUE: usize = 26;
/// Length of `CFBundleIdentifier</key><string>`.
const BUNDLE_ID_VALUE: usize = 32;
/// Longest load address text kept, including the `0x` prefix.
const MAX_ADDR_TEXT: usize = 18;

/// One (bundle, load address) pair read from the plist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrelinkEntry {
    /// Bundle identifier, or the bundle name when no identifier follows
    pub bundle_id: String,
    /// Load address as written, e.g. `0xfffffff0059f8180`
    pub load_addr_text: String,
    /// Parsed load address, `None` if the text is not hexadecimal
    pub load_addr: Option<u64>,
    /// Offset of the entry's `CFBundleName` key within the plist
    pub offset: usize,
}

/// Iterator over the entries of a prelink plist.
#[derive(Debug, Clone)]
pub struct PrelinkScanner<'a> {
    xml: &'a [u8],
    next: Option<usize>,
}

impl<'a> PrelinkScanner<'a> {
    /// Starts a scan over the raw `__PRELINK_INFO` bytes.
    ///
    /// Fails if the plist has no load-address map.
    pub fn new(xml: &'a [u8]) -> Result<Self> {
        if !contains(xml, MAP_MARKER) {
            return Err(Error::parse(
                0,
                "__PRELINK_INFO has no PrelinkExecutableLoadAddr map",
            ));
        }
        Ok(Self {
            xml,
            next: find_from(xml, BUNDLE_NAME_KEY, 0),
        })
    }

    /// Reads the entry whose `CFBundleName` key is at `key`, returning it with
    /// the position the next search starts from.
    pub fn entry_at(&self, key: usize) -> Option<(PrelinkEntry, usize)> {
        let xml = self.xml;
        let name_end = find_from(xml, STRING_END, key)?;

        let Some(prelink) = find_from(xml, LOAD_ADDR_KEY, key) else {
            warn!("no _PrelinkExecutableLoadAddr after offset {:#x}, stopping", key);
            return None;
        };
        let load_addr_text = find_from(xml, b"0x", prelink)
            .map(|p| hex_text(xml, p))
            .unwrap_or_default();
        let load_addr = load_addr_text
            .strip_prefix("0x")
            .filter(|digits| !digits.is_empty())
            .and_then(|digits| u64::from_str_radix(digits, 16).ok());

        let mut bundle_id = string_value(xml, key, BUNDLE_NAME_VALUE, name_end);
        let mut end = name_end;

        if let Some(id_key) = find_from(xml, BUNDLE_ID_KEY, name_end + STRING_END.len() + 1) {
            if let Some(id_end) = find_from(xml, STRING_END, id_key) {
                bundle_id = string_value(xml, id_key, BUNDLE_ID_VALUE, id_end);
                end = id_end;
            }
        }

        let entry = PrelinkEntry {
            bundle_id,
            load_addr_text,
            load_addr,
            offset: key,
        };
        Some((entry, end))
    }
}

impl<'a> Iterator for PrelinkScanner<'a> {
    type Item = PrelinkEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next.take()?;
        let (entry, end) = self.entry_at(key)?;
        self.next = find_from(self.xml, BUNDLE_NAME_KEY, end);
        Some(entry)
    }
}

/// Reads a `<string>` value that ends at `end`. A value written as
/// `<string ID="n">` starts after the attribute; otherwise it starts
/// `value_offset` bytes after the key.
fn string_value(xml: &[u8], key: usize, value_offset: usize, end: usize) -> String {
    let start = match find_within(xml, ID_ATTR, key, end) {
        Some(attr) => find_from(xml, ID_ATTR_END, attr + ID_ATTR.len())
            .map(|p| p + ID_ATTR_END.len())
            .unwrap_or(end),
        None => key + value_offset,
    };
    if start >= end {
        return String::new();
    }
    String::from_utf8_lossy(&xml[start..end]).into_owned()
}

/// Reads `0x` plus up to 16 hex digits at `pos`.
fn hex_text(xml: &[u8], pos: usize) -> String {
    let digits = xml[pos + 2..]
        .iter()
        .take(MAX_ADDR_TEXT - 2)
        .take_while(|b| b.is_ascii_hexdigit())
        .count();
    String::from_utf8_lossy(&xml[pos..pos + 2 + digits]).into_owned()
}
