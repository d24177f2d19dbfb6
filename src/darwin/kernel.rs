//! XNU kernelcache model.

use std::fmt;

use tracing::{debug, info};

use super::devices::describe_device;
use super::kext::{fileset_style, merged_style, split_style, KextList, KextRecord};
use super::traps::TrapTable;
use crate::error::{Error, Result};
use crate::macho::{is_arm, is_x86, MachOImage, PLATFORM_MACOS};
use crate::util::{checked_range, find_from, printable_at, text_until};

/// Fileset entry that holds the kernel proper.
pub const KERNEL_ENTRY_ID: &str = "com.apple.kernel";

/// Start of the kernel's uname string.
pub const UNAME_MARKER: &[u8] = b"Darwin Kernel Version ";

const MAX_UNAME: usize = 256;

// =============================================================================
// Kernel Variant
// =============================================================================

/// On-disk layout of a kernelcache.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVariant {
    Ios9Legacy,
    IosSplit,
    IosMerged,
    IosFileset,
    IosFilesetExtracted,
    MacosIntel,
    MacosAppleSilicon,
    MacosDeveloperTransitionKit,
    UnknownIos,
    UnknownMacos,
    UnknownPlatform,
}

impl KernelVariant {
    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelVariant::Ios9Legacy => "Legacy (iOS 9)",
            KernelVariant::IosSplit => "Split (iOS 10-11)",
            KernelVariant::IosMerged => "Merged (iOS 12-15)",
            KernelVariant::IosFileset => "Fileset (iOS 16)",
            KernelVariant::IosFilesetExtracted => "Fileset Extracted (iOS 16)",
            KernelVariant::MacosIntel => "Intel-Genuine (x86_64)",
            KernelVariant::MacosAppleSilicon => "Apple-Silicon (arm64)",
            KernelVariant::MacosDeveloperTransitionKit => "Developer-Transition-Kit (arm64)",
            KernelVariant::UnknownIos => "Unknown-iOS",
            KernelVariant::UnknownMacos => "Unknown-macOS",
            KernelVariant::UnknownPlatform => "Unknown-Platform",
        }
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Determines the layout of a kernelcache.
///
/// `fileset_kernel` is the `com.apple.kernel` entry of an `MH_FILESET`
/// outer image. Structural checks look at it when present, but the fileset
/// tag itself comes from the outer image. Checks run in release order, so
/// the first match wins.
pub fn resolve_variant(
    outer: &MachOImage<'_>,
    fileset_kernel: Option<&MachOImage<'_>>,
) -> KernelVariant {
    let image = fileset_kernel.unwrap_or(outer);
    let cputype = image.header.cputype;
    if !is_arm(cputype) && !is_x86(cputype) {
        return KernelVariant::UnknownPlatform;
    }

    if image
        .build_version()
        .is_some_and(|bv| bv.platform == PLATFORM_MACOS)
    {
        return if image.header.is_x86_64() {
            KernelVariant::MacosIntel
        } else if !image.header.is_arm64() {
            KernelVariant::UnknownMacos
        } else if image.section("__PPLTRAMP", "__text").is_some() {
            KernelVariant::MacosDeveloperTransitionKit
        } else {
            KernelVariant::MacosAppleSilicon
        };
    }

    if fileset_kernel.is_some()
        && outer
            .text_segment()
            .is_some_and(|text| text.command.nsects == 0)
    {
        return KernelVariant::IosFileset;
    }
    if image
        .segment("__PRELINK_INFO")
        .is_some_and(|seg| seg.command.vmsize == 0)
    {
        return KernelVariant::IosFilesetExtracted;
    }
    if image
        .section("__PLK_TEXT_EXEC", "__text")
        .is_some_and(|s| s.section.size > 0)
    {
        return KernelVariant::IosSplit;
    }
    if image.section("__PRELINK_INFO", "__kmod_info").is_some() {
        return KernelVariant::IosMerged;
    }
    if image.segment("__TEXT_EXEC").is_none() {
        return KernelVariant::Ios9Legacy;
    }
    KernelVariant::UnknownIos
}

// =============================================================================
// Kernel Version
// =============================================================================

/// Fields of the kernel's uname string, e.g.
/// `Darwin Kernel Version 19.2.0: Mon Nov  4 17:46:45 PST 2019;
/// root:xnu-6153.60.66~39/RELEASE_ARM64_T8030`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    /// The full uname string
    pub uname: String,
    /// Darwin version, e.g. `19.2.0`
    pub darwin: Option<String>,
    /// XNU build, e.g. `xnu-6153.60.66~39`
    pub xnu: Option<String>,
    /// Build timestamp
    pub build_time: Option<String>,
    /// Target SoC, e.g. `A13 Bionic (T8030)`, or `x86_64`
    pub device: Option<String>,
}

impl KernelVersion {
    /// Finds the uname string in a kernel image.
    pub fn find(data: &[u8]) -> Option<Self> {
        let pos = find_from(data, UNAME_MARKER, 0)?;
        printable_at(data, pos, MAX_UNAME).map(|uname| Self::parse(&uname))
    }

    /// Splits a uname string into its fields.
    pub fn parse(uname: &str) -> Self {
        let bytes = uname.as_bytes();
        let after = |needle: &str| find_from(bytes, needle.as_bytes(), 0).map(|p| p + needle.len());

        let darwin = after("Version ").and_then(|p| text_until(bytes, p, b':'));
        let build_time = after(": ").and_then(|p| text_until(bytes, p, b';'));
        let xnu = after("root:").and_then(|p| text_until(bytes, p, b'/'));

        let device = match after("ARM64_") {
            Some(p) => {
                let id: String = uname[p..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect();
                (!id.is_empty()).then(|| describe_device(&id))
            }
            None if uname.contains("X86_64") => Some("x86_64".to_string()),
            None => None,
        };

        Self {
            uname: uname.to_string(),
            darwin,
            xnu,
            build_time,
            device,
        }
    }
}

// =============================================================================
// Kernel Image
// =============================================================================

/// A parsed kernelcache.
#[derive(Debug)]
pub struct KernelImage<'a> {
    macho: MachOImage<'a>,
    fileset_kernel: Option<MachOImage<'a>>,
    variant: KernelVariant,
    version: Option<KernelVersion>,
}

impl<'a> KernelImage<'a> {
    /// Parses a kernelcache whose header is at the start of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        Self::from_macho(MachOImage::parse(data)?)
    }

    /// Wraps an already parsed image.
    pub fn from_macho(macho: MachOImage<'a>) -> Result<Self> {
        let fileset_kernel = if macho.header.is_fileset() {
            match macho.fileset_image(KERNEL_ENTRY_ID) {
                Ok(kernel) => Some(kernel),
                Err(Error::NotFound { .. }) => {
                    debug!("fileset has no {} entry", KERNEL_ENTRY_ID);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let variant = resolve_variant(&macho, fileset_kernel.as_ref());
        let version = KernelVersion::find(macho.data());
        info!("kernelcache layout: {}", variant);

        Ok(Self {
            macho,
            fileset_kernel,
            variant,
            version,
        })
    }

    /// The image as loaded.
    pub fn macho(&self) -> &MachOImage<'a> {
        &self.macho
    }

    /// The `com.apple.kernel` entry of a fileset kernelcache.
    pub fn fileset_kernel(&self) -> Option<&MachOImage<'a>> {
        self.fileset_kernel.as_ref()
    }

    /// The image holding the kernel proper.
    pub fn kernel(&self) -> &MachOImage<'a> {
        self.fileset_kernel.as_ref().unwrap_or(&self.macho)
    }

    /// The resolved layout.
    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// The parsed uname string, if present.
    pub fn version(&self) -> Option<&KernelVersion> {
        self.version.as_ref()
    }

    /// Locates every embedded KEXT.
    ///
    /// A kernel extracted from a fileset no longer carries its KEXT map and
    /// yields an unsupported-variant error rather than an empty list.
    pub fn kexts(&self) -> Result<KextList> {
        match self.variant {
            KernelVariant::Ios9Legacy | KernelVariant::IosSplit => split_style(self.kernel()),
            KernelVariant::IosMerged => merged_style(self.kernel()),
            KernelVariant::IosFileset | KernelVariant::MacosAppleSilicon => {
                fileset_style(&self.macho)
            }
            KernelVariant::IosFilesetExtracted => Err(Error::unsupported(
                "cannot parse KEXTs of an extracted fileset kernel",
            )),
            other => Err(Error::unsupported(format!(
                "KEXT discovery for {} kernels",
                other
            ))),
        }
    }

    /// Returns the bytes a record refers to.
    pub fn kext_bytes(&self, kext: &KextRecord) -> Result<&'a [u8]> {
        checked_range(self.macho.data(), kext.offset, kext.size)
    }

    /// Parses the Mach-O header a record refers to.
    pub fn kext_image(&self, kext: &KextRecord) -> Result<MachOImage<'a>> {
        MachOImage::parse_at(self.macho.data(), kext.offset)
    }

    /// Copies out the KEXT with the given bundle identifier.
    pub fn extract_kext(&self, name: &str) -> Result<Vec<u8>> {
        let list = self.kexts()?;
        let kext = list
            .find(name)
            .ok_or_else(|| Error::not_found("KEXT", name))?;
        Ok(self.kext_bytes(kext)?.to_vec())
    }

    /// Locates the Mach trap table of the kernel proper.
    pub fn mach_traps(&self) -> Result<TrapTable> {
        TrapTable::find(self.kernel())
    }
}

/// Parses a kernelcache.
pub fn parse_kernel(data: &[u8]) -> Result<KernelImage<'_>> {
    KernelImage::parse(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::macho::*;
    use crate::testutil::*;

    const TEXT_VMADDR: u64 = 0xfffffff007004000;
    const UNAME: &str =
        "Darwin Kernel Version 19.2.0: Mon Nov  4 17:46:45 PST 2019; root:xnu-6153.60.66~39/RELEASE_ARM64_T8030";

    /// An iOS 12-15 style kernel with one KEXT at 0x4000 and its kmod_info at
    /// 0x1000.
    fn merged_kernel() -> Vec<u8> {
        let info_vmaddr = 0xfffffff007010000;
        let mut buf = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", TEXT_VMADDR, 0x3000, 0, 0x3000, &[])
            .segment("__TEXT_EXEC", 0xfffffff007008000, 0x1000, 0x4000, 0x1000, &[])
            .segment(
                "__PRELINK_INFO",
                info_vmaddr,
                0x1000,
                0x5000,
                0x1000,
                &[
                    sect("__kmod_info", info_vmaddr, 8, 0x5000),
                    sect("__kmod_start", info_vmaddr + 8, 8, 0x5008),
                ],
            )
            .build(0x6000);

        put_u64_le(&mut buf, 0x5000, 0xfffffff007005000);
        put_u64_le(&mut buf, 0x5008, 0xfffffff007008000);

        put_bytes(&mut buf, 0x1000 + 16, b"com.apple.test.kext");
        put_bytes(&mut buf, 0x1000 + 80, b"1.0.0");
        put_bytes(&mut buf, 0x2000, UNAME.as_bytes());

        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0xfffffff007008000, 0x800, 0x4000, 0x800, &[])
            .uuid([0x11; 16])
            .write_into(&mut buf, 0x4000);
        buf
    }

    /// An iOS 10-11 style kernel with two KEXTs in the prelink plist.
    fn split_kernel() -> Vec<u8> {
        let plk_vmaddr = 0xfffffff005000000;
        let xml = format!(
            "<plist><array>{}{}</array></plist>",
            plist_entry("Foo", "com.apple.foo", "0xfffffff005000000"),
            plist_entry("Bad", "com.apple.bad", "0xnothex"),
        );
        let mut buf = MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", TEXT_VMADDR, 0x1000, 0, 0x1000, &[])
            .segment("__TEXT_EXEC", TEXT_VMADDR + 0x1000, 0x1000, 0x1000, 0x1000, &[])
            .segment(
                "__PLK_TEXT_EXEC",
                plk_vmaddr + 0x1000,
                0x1000,
                0x3000,
                0x1000,
                &[sect("__text", plk_vmaddr + 0x1000, 0x100, 0x3000)],
            )
            .segment("__PRELINK_TEXT", plk_vmaddr, 0x1000, 0x2000, 0x1000, &[])
            .segment("__PRELINK_INFO", 0xfffffff006000000, 0x1000, 0x4000, 0x1000, &[])
            .build(0x5000);
        put_bytes(&mut buf, 0x4000, xml.as_bytes());
        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", plk_vmaddr, 0x400, 0x2000, 0x400, &[])
            .source_version(0x101_4000_0000)
            .write_into(&mut buf, 0x2000);
        buf
    }

    /// An iOS 16 fileset with the kernel at 0x1000 and one KEXT at 0x2000.
    fn fileset_kernel(outer_text_sections: bool) -> Vec<u8> {
        let text_sections = if outer_text_sections {
            vec![sect("__const", TEXT_VMADDR, 0x10, 0x800)]
        } else {
            Vec::new()
        };
        let mut buf = MachOBuilder::arm64(MH_FILESET)
            .segment("__TEXT", TEXT_VMADDR, 0x1000, 0, 0x1000, &text_sections)
            .fileset_entry(TEXT_VMADDR + 0x1000, 0x1000, KERNEL_ENTRY_ID)
            .fileset_entry(TEXT_VMADDR + 0x2000, 0x2000, "com.apple.driver.Foo")
            .build(0x3000);
        MachOBuilder::arm64(MH_EXECUTE)
            .segment("__TEXT", TEXT_VMADDR + 0x1000, 0x1000, 0x1000, 0x800, &[])
            .segment("__TEXT_EXEC", TEXT_VMADDR + 0x1800, 0x800, 0x1800, 0x800, &[])
            .write_into(&mut buf, 0x1000);
        MachOBuilder::arm64(MH_KEXT_BUNDLE)
            .segment("__TEXT", TEXT_VMADDR + 0x2000, 0x800, 0x2000, 0x800, &[])
            .source_version(0x200_4000_0000)
            .write_into(&mut buf, 0x2000);
        buf
    }

    fn variant_of(builder: MachOBuilder) -> KernelVariant {
        let data = builder.build(0x2000);
        KernelImage::parse(&data).unwrap().variant()
    }

    fn ios() -> MachOBuilder {
        MachOBuilder::arm64(MH_EXECUTE).segment("__TEXT", TEXT_VMADDR, 0x1000, 0, 0x1000, &[])
    }

    #[test]
    fn test_resolve_ios_variants() {
        assert_eq!(variant_of(ios()), KernelVariant::Ios9Legacy);
        assert_eq!(
            variant_of(ios().segment("__TEXT_EXEC", TEXT_VMADDR + 0x1000, 0x1000, 0x1000, 0x1000, &[])),
            KernelVariant::UnknownIos
        );
        assert_eq!(
            variant_of(ios().segment("__PRELINK_INFO", 0xfffffff009000000, 0, 0, 0, &[])),
            KernelVariant::IosFilesetExtracted
        );
        assert_eq!(
            variant_of(
                ios()
                    .segment("__TEXT_EXEC", TEXT_VMADDR + 0x1000, 0x1000, 0x1000, 0x1000, &[])
                    .segment(
                        "__PLK_TEXT_EXEC",
                        0xfffffff008000000,
                        0x1000,
                        0x1000,
                        0x1000,
                        &[sect("__text", 0xfffffff008000000, 0x100, 0x1000)],
                    )
            ),
            KernelVariant::IosSplit
        );

        let data = merged_kernel();
        assert_eq!(KernelImage::parse(&data).unwrap().variant(), KernelVariant::IosMerged);
    }

    #[test]
    fn test_empty_plk_text_is_not_split() {
        let builder = ios()
            .segment("__TEXT_EXEC", TEXT_VMADDR + 0x1000, 0x1000, 0x1000, 0x1000, &[])
            .segment(
                "__PLK_TEXT_EXEC",
                0xfffffff008000000,
                0x1000,
                0x1000,
                0x1000,
                &[sect("__text", 0xfffffff008000000, 0, 0x1000)],
            );
        assert_eq!(variant_of(builder), KernelVariant::UnknownIos);
    }

    #[test]
    fn test_resolve_macos_variants() {
        let intel = MachOBuilder::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, MH_EXECUTE)
            .build_version(PLATFORM_MACOS);
        assert_eq!(variant_of(intel), KernelVariant::MacosIntel);

        let silicon = MachOBuilder::arm64(MH_EXECUTE).build_version(PLATFORM_MACOS);
        assert_eq!(variant_of(silicon), KernelVariant::MacosAppleSilicon);

        let dtk = MachOBuilder::arm64(MH_EXECUTE)
            .build_version(PLATFORM_MACOS)
            .segment(
                "__PPLTRAMP",
                0xfffffe0007000000,
                0x1000,
                0x1000,
                0x1000,
                &[sect("__text", 0xfffffe0007000000, 0x10, 0x1000)],
            );
        assert_eq!(variant_of(dtk), KernelVariant::MacosDeveloperTransitionKit);

        let armv7 = MachOBuilder::new32(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, MH_EXECUTE)
            .build_version(PLATFORM_MACOS);
        assert_eq!(variant_of(armv7), KernelVariant::UnknownMacos);

        let ppc = MachOBuilder::new(CPU_TYPE_POWERPC, 0, MH_EXECUTE);
        assert_eq!(variant_of(ppc), KernelVariant::UnknownPlatform);
    }

    #[test]
    fn test_resolve_fileset() {
        let data = fileset_kernel(false);
        let kernel = KernelImage::parse(&data).unwrap();
        assert_eq!(kernel.variant(), KernelVariant::IosFileset);
        assert_eq!(kernel.kernel().header_offset, 0x1000);

        // With sections in the outer __TEXT the inner kernel decides.
        let data = fileset_kernel(true);
        let kernel = KernelImage::parse(&data).unwrap();
        assert_eq!(kernel.variant(), KernelVariant::UnknownIos);
    }

    #[test]
    fn test_merged_end_to_end() {
        let data = merged_kernel();
        let kernel = parse_kernel(&data).unwrap();
        let list = kernel.kexts().unwrap();

        assert_eq!(list.len(), 1);
        assert!(list.errors.is_empty());
        let kext = &list.kexts[0];
        assert_eq!(kext.name, "com.apple.test.kext");
        assert_eq!(kext.version, "1.0.0");
        assert_eq!(kext.offset, 0x4000);
        assert_eq!(kext.size, 0x800);
        assert_eq!(kext.uuid, Some(uuid::Uuid::from_bytes([0x11; 16])));

        let image = kernel.kext_image(kext).unwrap();
        assert_eq!(image.header.filetype, MH_KEXT_BUNDLE);
    }

    #[test]
    fn test_merged_bad_pointer_is_item_error() {
        let mut data = merged_kernel();
        put_u64_le(&mut data, 0x5008, 0xfffffff007007000);
        let list = parse_kernel(&data).unwrap().kexts().unwrap();
        assert!(list.is_empty());
        assert_eq!(list.errors.len(), 1);
        assert_eq!(list.errors[0].error.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_split_end_to_end() {
        let data = split_kernel();
        let kernel = parse_kernel(&data).unwrap();
        assert_eq!(kernel.variant(), KernelVariant::IosSplit);

        let list = kernel.kexts().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.kexts[0].name, "com.apple.foo");
        assert_eq!(list.kexts[0].offset, 0x2000);
        assert_eq!(list.kexts[0].version, "1.5");
        assert_eq!(list.errors.len(), 1);
        assert_eq!(list.errors[0].index, 1);
    }

    #[test]
    fn test_fileset_kexts() {
        let data = fileset_kernel(false);
        let kernel = parse_kernel(&data).unwrap();
        let list = kernel.kexts().unwrap();
        let names: Vec<_> = list.kexts.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec![KERNEL_ENTRY_ID, "com.apple.driver.Foo"]);

        let foo = list.find("com.apple.driver.Foo").unwrap();
        assert_eq!(foo.offset, 0x2000);
        assert_eq!(foo.size, 0x800);
        assert_eq!(foo.version, "2.1");
        assert_eq!(foo.vmaddr, Some(TEXT_VMADDR + 0x2000));
    }

    #[test]
    fn test_extracted_fileset_is_unsupported() {
        let data = ios()
            .segment("__PRELINK_INFO", 0xfffffff009000000, 0, 0, 0, &[])
            .build(0x1000);
        let kernel = parse_kernel(&data).unwrap();
        let err = kernel.kexts().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.to_string().contains("extracted fileset kernel"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_extract_idempotent() {
        let data = merged_kernel();
        let kernel = parse_kernel(&data).unwrap();
        let first = kernel.extract_kext("com.apple.test.kext").unwrap();
        let second = kernel.extract_kext("com.apple.test.kext").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 0x800);
        assert_eq!(&first[..4], &MH_MAGIC_64.to_le_bytes());

        let err = kernel.extract_kext("com.apple.missing").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "KEXT", .. }));
    }

    #[test]
    fn test_uname() {
        let data = merged_kernel();
        let kernel = parse_kernel(&data).unwrap();
        let version = kernel.version().unwrap();
        assert_eq!(version.uname, UNAME);
        assert_eq!(version.darwin.as_deref(), Some("19.2.0"));
        assert_eq!(version.xnu.as_deref(), Some("xnu-6153.60.66~39"));
        assert_eq!(
            version.build_time.as_deref(),
            Some("Mon Nov  4 17:46:45 PST 2019")
        );
        assert_eq!(version.device.as_deref(), Some("A13 Bionic (T8030)"));

        let intel = KernelVersion::parse(
            "Darwin Kernel Version 22.1.0: Sun Oct  9 20:14:54 PDT 2022; root:xnu-8792.41.9~2/RELEASE_X86_64",
        );
        assert_eq!(intel.device.as_deref(), Some("x86_64"));
    }
}
