//! CMS signature blob scanning.
//!
//! The blob wrapper holds a DER-encoded CMS `SignedData`. Rather than parse
//! ASN.1, the certificate subject strings are picked out by their attribute
//! OID prefix `06 03 55 04`: the next byte is the attribute type, followed by
//! the string tag, the string length and the string itself.

use memchr::memmem;

use crate::error::Result;
use crate::util::ByteView;

/// OID prefix of X.520 attribute types (2.5.4).
const ATTRIBUTE_OID: [u8; 4] = [0x06, 0x03, 0x55, 0x04];

/// Attribute type of a certificate subject string.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectAttribute {
    CommonName,
    Country,
    Organization,
    CertificateAuthority,
    Other(u8),
}

impl From<u8> for SubjectAttribute {
    fn from(v: u8) -> Self {
        match v {
            0x03 => SubjectAttribute::CommonName,
            0x06 => SubjectAttribute::Country,
            0x0a => SubjectAttribute::Organization,
            0x0b => SubjectAttribute::CertificateAuthority,
            other => SubjectAttribute::Other(other),
        }
    }
}

impl SubjectAttribute {
    /// Short label used in listings.
    pub fn label(self) -> &'static str {
        match self {
            SubjectAttribute::CommonName => "CN",
            SubjectAttribute::Country => "C",
            SubjectAttribute::Organization => "O",
            SubjectAttribute::CertificateAuthority => "CA",
            SubjectAttribute::Other(_) => "?",
        }
    }
}

/// One subject string found in the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectString {
    /// Attribute type
    pub attribute: SubjectAttribute,
    /// Offset of the OID prefix within the blob
    pub offset: usize,
    /// String value
    pub value: String,
}

/// A scanned CMS blob wrapper.
#[derive(Debug, Clone)]
pub struct CmsSignature {
    /// Total blob length
    pub length: u32,
    /// Subject strings in blob order
    pub subjects: Vec<SubjectString>,
}

impl CmsSignature {
    /// Scans a blob wrapper starting at its magic.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let view = ByteView::new(blob);
        let length = view.u32_be(4)?;
        let end = (length as usize).min(blob.len());
        let body = view.bytes(8, end.saturating_sub(8))?;

        let subjects = memmem::find_iter(body, &ATTRIBUTE_OID)
            .filter_map(|pos| {
                let at = 8 + pos;
                let attribute = SubjectAttribute::from(view.u8_at(at + 4).ok()?);
                let size = view.u8_at(at + 6).ok()? as usize;
                let value = view.bytes(at + 7, size).ok()?;
                Some(SubjectString {
                    attribute,
                    offset: at,
                    value: String::from_utf8_lossy(value).into_owned(),
                })
            })
            .collect();

        Ok(Self { length, subjects })
    }

    /// Returns the `(CA, CN)` pairs of the certificate chain.
    ///
    /// Each common name is paired with the closest authority string before
    /// it, if any.
    pub fn certificate_pairs(&self) -> Vec<(Option<&str>, &str)> {
        let mut authority = None;
        let mut pairs = Vec::new();
        for subject in &self.subjects {
            match subject.attribute {
                SubjectAttribute::CertificateAuthority => authority = Some(subject.value.as_str()),
                SubjectAttribute::CommonName => pairs.push((authority, subject.value.as_str())),
                _ => {}
            }
        }
        pairs
    }
}
