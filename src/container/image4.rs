//! Image4 container sniffing.
//!
//! An Image4 file is a DER SEQUENCE whose first element is an IA5String
//! naming the container type. Only that tag is inspected.

use std::fmt;

use crate::util::ByteView;

const DER_SEQUENCE: u8 = 0x30;
const DER_IA5STRING: u8 = 0x16;

/// Kind of Image4 container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Image4Type {
    /// Complete Image4 (payload plus manifest)
    Img4,
    /// Image4 payload
    Im4p,
    /// Image4 manifest
    Im4m,
    /// Image4 restore info
    Im4r,
}

impl Image4Type {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"IMG4" => Some(Image4Type::Img4),
            b"IM4P" => Some(Image4Type::Im4p),
            b"IM4M" => Some(Image4Type::Im4m),
            b"IM4R" => Some(Image4Type::Im4r),
            _ => None,
        }
    }

    /// Returns the four-character tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Image4Type::Img4 => "IMG4",
            Image4Type::Im4p => "IM4P",
            Image4Type::Im4m => "IM4M",
            Image4Type::Im4r => "IM4R",
        }
    }
}

impl fmt::Display for Image4Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the Image4 type of `data`, or `None` if it is not Image4.
pub fn sniff(data: &[u8]) -> Option<Image4Type> {
    let view = ByteView::new(data);
    if view.u8_at(0).ok()? != DER_SEQUENCE {
        return None;
    }

    // Skip the SEQUENCE length (short or long form).
    let first = view.u8_at(1).ok()?;
    let mut pos = 2;
    if first & 0x80 != 0 {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return None;
        }
        pos += count;
    }

    if view.u8_at(pos).ok()? != DER_IA5STRING || view.u8_at(pos + 1).ok()? != 4 {
        return None;
    }
    Image4Type::from_tag(view.bytes(pos + 2, 4).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        let short = [0x30, 0x20, 0x16, 0x04, b'I', b'M', b'4', b'P', 0x16];
        assert_eq!(sniff(&short), Some(Image4Type::Im4p));

        let long = [0x30, 0x83, 0x01, 0x00, 0x00, 0x16, 0x04, b'I', b'M', b'G', b'4'];
        assert_eq!(sniff(&long), Some(Image4Type::Img4));

        assert_eq!(sniff(&[0x30, 0x20, 0x16, 0x04, b'A', b'B', b'C', b'D']), None);
        assert_eq!(sniff(&[0x30, 0x20, 0x16]), None);
        assert_eq!(sniff(b"\xcf\xfa\xed\xfe"), None);
    }
}
