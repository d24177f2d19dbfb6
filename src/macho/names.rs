//! Display names for CPU types, file types, platforms and load commands.

use super::constants::*;

/// Formats a CPU type/subtype pair the way `lipo` and `otool` print it.
pub fn cpu_name(cputype: u32, cpusubtype: u32) -> String {
    let sub = cpusubtype & !CPU_SUBTYPE_MASK;
    let name = match cputype {
        CPU_TYPE_ARM64 => match sub {
            CPU_SUBTYPE_ARM64E => "arm64e",
            _ => "arm64",
        },
        CPU_TYPE_ARM64_32 => "arm64_32",
        CPU_TYPE_ARM => match sub {
            CPU_SUBTYPE_ARM_V6 => "armv6",
            CPU_SUBTYPE_ARM_V7 => "armv7",
            CPU_SUBTYPE_ARM_V7F => "armv7f",
            CPU_SUBTYPE_ARM_V7S => "armv7s",
            CPU_SUBTYPE_ARM_V7K => "armv7k",
            CPU_SUBTYPE_ARM_V8 => "armv8",
            _ => "arm",
        },
        CPU_TYPE_X86_64 => match sub {
            CPU_SUBTYPE_X86_64_H => "x86_64h",
            _ => "x86_64",
        },
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_POWERPC => "powerpc",
        CPU_TYPE_POWERPC64 => "powerpc64",
        _ => return format!("unknown({:#x}/{:#x})", cputype, cpusubtype),
    };
    name.to_string()
}

/// Returns true if the CPU type belongs to the ARM family.
#[inline]
pub fn is_arm(cputype: u32) -> bool {
    matches!(cputype, CPU_TYPE_ARM | CPU_TYPE_ARM64 | CPU_TYPE_ARM64_32)
}

/// Returns true if the CPU type belongs to the x86 family.
#[inline]
pub fn is_x86(cputype: u32) -> bool {
    matches!(cputype, CPU_TYPE_X86 | CPU_TYPE_X86_64)
}

/// Returns the name of a Mach-O file type.
pub fn filetype_name(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "OBJECT",
        MH_EXECUTE => "EXECUTE",
        MH_FVMLIB => "FVMLIB",
        MH_CORE => "CORE",
        MH_PRELOAD => "PRELOAD",
        MH_DYLIB => "DYLIB",
        MH_DYLINKER => "DYLINKER",
        MH_BUNDLE => "BUNDLE",
        MH_DYLIB_STUB => "DYLIB_STUB",
        MH_DSYM => "DSYM",
        MH_KEXT_BUNDLE => "KEXT_BUNDLE",
        MH_FILESET => "FILESET",
        _ => "UNKNOWN",
    }
}

/// Returns the name of a build-version platform.
pub fn platform_name(platform: u32) -> &'static str {
    match platform {
        PLATFORM_MACOS => "macOS",
        PLATFORM_IOS => "iOS",
        PLATFORM_TVOS => "tvOS",
        PLATFORM_WATCHOS => "watchOS",
        PLATFORM_BRIDGEOS => "bridgeOS",
        PLATFORM_MACCATALYST => "macCatalyst",
        PLATFORM_IOSSIMULATOR => "iOS Simulator",
        PLATFORM_TVOSSIMULATOR => "tvOS Simulator",
        PLATFORM_WATCHOSSIMULATOR => "watchOS Simulator",
        PLATFORM_DRIVERKIT => "DriverKit",
        PLATFORM_VISIONOS => "visionOS",
        PLATFORM_VISIONOSSIMULATOR => "visionOS Simulator",
        _ => "unknown",
    }
}

/// Returns the symbolic name of a load command.
pub fn load_command_name(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_SYMSEG => "LC_SYMSEG",
        LC_THREAD => "LC_THREAD",
        LC_UNIXTHREAD => "LC_UNIXTHREAD",
        LC_LOADFVMLIB => "LC_LOADFVMLIB",
        LC_IDFVMLIB => "LC_IDFVMLIB",
        LC_IDENT => "LC_IDENT",
        LC_FVMFILE => "LC_FVMFILE",
        LC_PREPAGE => "LC_PREPAGE",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_PREBOUND_DYLIB => "LC_PREBOUND_DYLIB",
        LC_ROUTINES => "LC_ROUTINES",
        LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
        LC_SUB_UMBRELLA => "LC_SUB_UMBRELLA",
        LC_SUB_CLIENT => "LC_SUB_CLIENT",
        LC_SUB_LIBRARY => "LC_SUB_LIBRARY",
        LC_TWOLEVEL_HINTS => "LC_TWOLEVEL_HINTS",
        LC_PREBIND_CKSUM => "LC_PREBIND_CKSUM",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_ROUTINES_64 => "LC_ROUTINES_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
        LC_ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
        LC_ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
        LC_LINKER_OPTION => "LC_LINKER_OPTION",
        LC_LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
        LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
        LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
        LC_NOTE => "LC_NOTE",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
        LC_FILESET_ENTRY => "LC_FILESET_ENTRY",
        LC_ATOM_INFO => "LC_ATOM_INFO",
        _ => "LC_UNKNOWN",
    }
}

/// Returns the name of a stab symbol type.
pub fn stab_name(n_type: u8) -> Option<&'static str> {
    STAB_NAMES
        .iter()
        .find(|(t, _)| *t == n_type)
        .map(|(_, name)| *name)
}

static STAB_NAMES: &[(u8, &str)] = &[
    (N_GSYM, "GSYM"),
    (N_FNAME, "FNAME"),
    (N_FUN, "FUN"),
    (N_STSYM, "STSYM"),
    (N_LCSYM, "LCSYM"),
    (N_BNSYM, "BNSYM"),
    (N_AST, "AST"),
    (N_OPT, "OPT"),
    (N_RSYM, "RSYM"),
    (N_SLINE, "SLINE"),
    (N_ENSYM, "ENSYM"),
    (N_SSYM, "SSYM"),
    (N_SO, "SO"),
    (N_OSO, "OSO"),
    (N_LSYM, "LSYM"),
    (N_BINCL, "BINCL"),
    (N_SOL, "SOL"),
    (N_PARAMS, "PARAM"),
    (N_VERSION, "VERS"),
    (N_OLEVEL, "OLEV"),
    (N_PSYM, "PSYM"),
    (N_EINCL, "EINCL"),
    (N_ENTRY, "ENTRY"),
    (N_LBRAC, "LBRAC"),
    (N_EXCL, "EXCL"),
    (N_RBRAC, "RBRAC"),
    (N_BCOMM, "BCOMM"),
    (N_ECOMM, "ECOMM"),
    (N_ECOML, "ECOML"),
    (N_LENG, "LENG"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_names() {
        assert_eq!(cpu_name(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL), "arm64");
        assert_eq!(cpu_name(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E | 0x8000_0000), "arm64e");
        assert_eq!(cpu_name(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S), "armv7s");
        assert_eq!(cpu_name(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H), "x86_64h");
        assert_eq!(cpu_name(CPU_TYPE_X86, 3), "i386");
        assert!(cpu_name(0x1234, 0).starts_with("unknown"));
    }

    #[test]
    fn test_other_names() {
        assert_eq!(filetype_name(MH_FILESET), "FILESET");
        assert_eq!(platform_name(PLATFORM_MACOS), "macOS");
        assert_eq!(load_command_name(LC_SEGMENT_64), "LC_SEGMENT_64");
        assert_eq!(stab_name(N_FUN), Some("FUN"));
        assert_eq!(stab_name(0x02), None);
    }
}
