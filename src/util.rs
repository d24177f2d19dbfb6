//! Bounds-checked byte access and search primitives.
//!
//! Every decoder in the crate reads through [`ByteView`] or [`Cursor`]. A read
//! is validated against the length of the borrowed buffer before any bytes are
//! touched, and fails with [`Error::OutOfBounds`] instead of panicking.
//!
//! Searches use `memchr`, which vectorizes on x86-64 and ARM64.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memchr::memmem;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};

// =============================================================================
// ByteView
// =============================================================================

/// An immutable view over a borrowed byte region.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    data: &'a [u8],
}

impl<'a> ByteView<'a> {
    /// Creates a view over the whole slice.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the underlying slice.
    #[inline]
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the length of the view.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the view is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `len` bytes at `offset`.
    #[inline]
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        checked_range(self.data, offset, len)
    }

    /// Returns everything from `offset` to the end.
    pub fn tail(&self, offset: usize) -> Result<ByteView<'a>> {
        if offset > self.data.len() {
            return Err(Error::out_of_bounds(offset as u64, 0, self.data.len()));
        }
        Ok(ByteView {
            data: &self.data[offset..],
        })
    }

    /// Reads a byte.
    #[inline]
    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    /// Reads a little-endian u32.
    #[inline]
    pub fn u32_le(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    /// Reads a little-endian u64.
    #[inline]
    pub fn u64_le(&self, offset: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(offset, 8)?))
    }

    /// Reads a big-endian u16.
    #[inline]
    pub fn u16_be(&self, offset: usize) -> Result<u16> {
        Ok(BigEndian::read_u16(self.bytes(offset, 2)?))
    }

    /// Reads a big-endian u32.
    #[inline]
    pub fn u32_be(&self, offset: usize) -> Result<u32> {
        Ok(BigEndian::read_u32(self.bytes(offset, 4)?))
    }

    /// Reads a big-endian u64.
    #[inline]
    pub fn u64_be(&self, offset: usize) -> Result<u64> {
        Ok(BigEndian::read_u64(self.bytes(offset, 8)?))
    }

    /// Finds `needle` at or after `from`.
    #[inline]
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        find_from(self.data, needle, from)
    }

    /// Reads a NUL-terminated string starting at `offset`, stopping at the
    /// end of the view if no terminator is present.
    pub fn cstr_at(&self, offset: usize) -> Result<String> {
        let rest = self.tail(offset)?.data;
        Ok(String::from_utf8_lossy(&rest[..memchr_null(rest)]).into_owned())
    }

    /// Returns a cursor positioned at `offset`.
    #[inline]
    pub fn cursor(&self, offset: usize) -> Cursor<'a> {
        Cursor {
            view: *self,
            pos: offset,
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// A sequential reader over a [`ByteView`].
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    view: ByteView<'a>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Current position relative to the view.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skips `n` bytes, checking that they exist.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.view.bytes(self.pos, n)?;
        self.pos += n;
        Ok(())
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.view.u8_at(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    /// Reads a big-endian u16.
    pub fn read_u16_be(&mut self) -> Result<u16> {
        let v = self.view.u16_be(self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    /// Reads a big-endian u32.
    pub fn read_u32_be(&mut self) -> Result<u32> {
        let v = self.view.u32_be(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    /// Reads a big-endian u64.
    pub fn read_u64_be(&mut self) -> Result<u64> {
        let v = self.view.u64_be(self.pos)?;
        self.pos += 8;
        Ok(v)
    }
}

// =============================================================================
// Free Helpers
// =============================================================================

/// Returns `data[offset..offset + len]`, or an out-of-bounds error.
#[inline]
pub fn checked_range(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    match offset.checked_add(len) {
        Some(end) if end <= data.len() => Ok(&data[offset..end]),
        _ => Err(Error::out_of_bounds(offset as u64, len as u64, data.len())),
    }
}

/// Reads a little-endian on-disk record at `offset` after checking that the
/// whole record is inside `data`.
#[inline]
pub fn read_struct<T>(data: &[u8], offset: usize) -> Result<T>
where
    T: FromBytes + KnownLayout + Immutable,
{
    let bytes = checked_range(data, offset, std::mem::size_of::<T>())?;
    T::read_from_prefix(bytes)
        .map(|(value, _)| value)
        .map_err(|_| Error::parse(offset, "short record"))
}

/// Converts a 64-bit file offset and size into a checked slice.
#[inline]
pub fn checked_range_u64(data: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    match (usize::try_from(offset), usize::try_from(len)) {
        (Ok(o), Ok(l)) => checked_range(data, o, l),
        _ => Err(Error::out_of_bounds(offset, len, data.len())),
    }
}

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Finds `needle` in `haystack` at or after `from`.
#[inline]
pub fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    memmem::find(&haystack[from..], needle).map(|p| p + from)
}

/// Finds `needle` within `haystack[from..to]`.
#[inline]
pub fn find_within(haystack: &[u8], needle: &[u8], from: usize, to: usize) -> Option<usize> {
    let to = to.min(haystack.len());
    if from > to {
        return None;
    }
    memmem::find(&haystack[from..to], needle).map(|p| p + from)
}

/// Returns true if `haystack` contains `needle`.
#[inline]
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    memmem::find(haystack, needle).is_some()
}

/// Reads a NUL-padded fixed-width name field.
pub fn fixed_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..memchr_null(bytes)]).into_owned()
}

/// Reads the printable run starting at `offset`, ending at a NUL, a
/// non-printable byte, or `max` bytes.
pub fn printable_at(data: &[u8], offset: usize, max: usize) -> Option<String> {
    let rest = data.get(offset..)?;
    let end = rest
        .iter()
        .take(max)
        .position(|&b| !(0x20..0x7f).contains(&b))
        .unwrap_or(rest.len().min(max));
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Reads text from `offset` up to (not including) the first `delim` byte.
pub fn text_until(data: &[u8], offset: usize, delim: u8) -> Option<String> {
    let rest = data.get(offset..)?;
    let end = memchr::memchr(delim, rest)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Aligns a value up to the given power-of-two alignment.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_endian_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let view = ByteView::new(&data);
        assert_eq!(view.u32_le(0).unwrap(), 0x04030201);
        assert_eq!(view.u32_be(0).unwrap(), 0x01020304);
        assert_eq!(view.u64_le(0).unwrap(), 0x0807060504030201);
        assert_eq!(view.u16_be(6).unwrap(), 0x0708);
    }

    #[test]
    fn test_out_of_bounds() {
        let data = [0u8; 6];
        let view = ByteView::new(&data);
        let err = view.u64_le(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
        assert!(view.u32_le(3).is_err());
        assert!(view.bytes(usize::MAX, 2).is_err());
        assert!(view.tail(7).is_err());
        assert!(view.tail(6).unwrap().is_empty());
    }

    #[test]
    fn test_tail() {
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let tail = ByteView::new(&data).tail(4).unwrap();
        assert_eq!(tail.len(), 4);
        assert_eq!(tail.u8_at(0).unwrap(), 4);
        assert!(tail.u32_le(1).is_err());
    }

    #[test]
    fn test_cursor() {
        let data = [0xfa, 0xde, 0x0c, 0xc0, 0, 0, 0, 0x14, 0xff];
        let mut cur = ByteView::new(&data).cursor(0);
        assert_eq!(cur.read_u32_be().unwrap(), 0xfade0cc0);
        assert_eq!(cur.read_u32_be().unwrap(), 0x14);
        assert_eq!(cur.read_u8().unwrap(), 0xff);
        assert!(cur.read_u8().is_err());
        assert_eq!(cur.position(), 9);
    }

    #[test]
    fn test_search() {
        let hay = b"xxbvx2....bvx$yy";
        assert_eq!(find_from(hay, b"bvx2", 0), Some(2));
        assert_eq!(find_from(hay, b"bvx$", 3), Some(10));
        assert_eq!(find_from(hay, b"bvx2", 3), None);
        assert_eq!(find_from(hay, b"x", 100), None);
        assert_eq!(find_within(hay, b"bvx$", 0, 12), None);
        assert!(contains(hay, b"yy"));
    }

    #[test]
    fn test_strings() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(fixed_str(b"__TEXT\0\0\0\0"), "__TEXT");
        assert_eq!(
            printable_at(b"AppleSMC\x00junk", 0, 64).as_deref(),
            Some("AppleSMC")
        );
        assert_eq!(text_until(b"19.2.0: Mon", 0, b':').as_deref(), Some("19.2.0"));
        let view = ByteView::new(b"abc\0def");
        assert_eq!(view.cstr_at(4).unwrap(), "def");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(0x1000, 0x4000), 0x4000);
    }
}
