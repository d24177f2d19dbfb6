//! Requirement set decoding.

use crate::error::Result;
use crate::util::ByteView;

/// Kind of a requirement within a set.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    PlugIn,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => RequirementType::Host,
            2 => RequirementType::Guest,
            3 => RequirementType::Designated,
            4 => RequirementType::Library,
            5 => RequirementType::PlugIn,
            other => RequirementType::Unknown(other),
        }
    }
}

impl RequirementType {
    /// Returns the display name.
    pub fn name(self) -> &'static str {
        match self {
            RequirementType::Host => "Host",
            RequirementType::Guest => "Guest",
            RequirementType::Designated => "Designated",
            RequirementType::Library => "Library",
            RequirementType::PlugIn => "Plug-In",
            RequirementType::Unknown(_) => "(unknown)",
        }
    }
}

/// One requirement of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Requirement kind
    pub kind: RequirementType,
    /// Offset of the requirement blob within the set
    pub offset: u32,
    /// Size of the requirement blob
    pub size: u32,
    /// Leading string operand of the expression
    pub text: String,
}

/// A decoded requirement set.
#[derive(Debug, Clone)]
pub struct RequirementSet {
    /// Total blob length
    pub length: u32,
    /// Requirements in index order
    pub requirements: Vec<Requirement>,
}

impl RequirementSet {
    /// Decodes a requirement set starting at its magic.
    ///
    /// Only the first string operand of each expression is extracted; it
    /// holds the identifier for the usual `identifier "..." and ...` form.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let view = ByteView::new(blob);
        let length = view.u32_be(4)?;
        let count = view.u32_be(8)?;

        let mut requirements = Vec::with_capacity(count.min(16) as usize);
        for i in 0..count as usize {
            let kind = RequirementType::from(view.u32_be(12 + i * 8)?);
            let offset = view.u32_be(16 + i * 8)?;
            let req = view.tail(offset as usize)?;
            let size = req.u32_be(4)?;
            let text_len = req.u32_be(20)? as usize;
            let text = String::from_utf8_lossy(req.bytes(24, text_len)?).into_owned();
            requirements.push(Requirement {
                kind,
                offset,
                size,
                text,
            });
        }

        Ok(Self {
            length,
            requirements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::{CSMAGIC_REQUIREMENT, CSMAGIC_REQUIREMENTS};
    use crate::testutil::*;

    fn requirement(ident: &str) -> Vec<u8> {
        // kind=expr, opAnd, opIdent, len, string
        let mut payload = vec![0u8; 16];
        put_u32_be(&mut payload, 0, 1);
        put_u32_be(&mut payload, 4, 6);
        put_u32_be(&mut payload, 8, 2);
        put_u32_be(&mut payload, 12, ident.len() as u32);
        payload.extend_from_slice(ident.as_bytes());
        generic_blob(CSMAGIC_REQUIREMENT, &payload)
    }

    #[test]
    fn test_requirement_set() {
        let designated = requirement("com.apple.example");
        let odd = requirement("x");
        let mut payload = vec![0u8; 20];
        put_u32_be(&mut payload, 0, 2);
        put_u32_be(&mut payload, 4, 3);
        put_u32_be(&mut payload, 8, 28);
        put_u32_be(&mut payload, 12, 9);
        put_u32_be(&mut payload, 16, (28 + designated.len()) as u32);
        payload.extend_from_slice(&designated);
        payload.extend_from_slice(&odd);
        let blob = generic_blob(CSMAGIC_REQUIREMENTS, &payload);

        let set = RequirementSet::parse(&blob).unwrap();
        assert_eq!(set.requirements.len(), 2);
        assert_eq!(set.requirements[0].kind.name(), "Designated");
        assert_eq!(set.requirements[0].text, "com.apple.example");
        assert_eq!(set.requirements[0].size, designated.len() as u32);
        assert_eq!(set.requirements[1].kind, RequirementType::Unknown(9));
        assert_eq!(set.requirements[1].kind.name(), "(unknown)");
    }

    #[test]
    fn test_bad_offset() {
        let mut payload = vec![0u8; 12];
        put_u32_be(&mut payload, 0, 1);
        put_u32_be(&mut payload, 4, 3);
        put_u32_be(&mut payload, 8, 0x1000);
        let blob = generic_blob(CSMAGIC_REQUIREMENTS, &payload);
        assert!(RequirementSet::parse(&blob).is_err());
    }
}
