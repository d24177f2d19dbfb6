//! machscope - Mach-O and Darwin firmware inspector.
//!
//! Inspect Mach-O images and pull KEXTs, iBoot payloads and Secure Enclave
//! components out of firmware images.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use machscope::codesign::{
    blob_magic_name, hex_string, Blob, CodeDirectory, CodeSignature,
    CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, CSMAGIC_EMBEDDED_ENTITLEMENTS,
};
use machscope::darwin::{describe_device, KernelImage};
use machscope::iboot::IbootImage;
use machscope::macho::{
    cpu_name, filetype_name, format_packed_version, format_source_version, platform_name,
    read_symbols,
};
use machscope::sep::SepFirmware;
use machscope::{
    decode_code_signature, load_and_classify, resolve_firmware_kind, select_architecture,
    AnalyzeOptions, Container, Error, Firmware, ItemError, LoadedFile, MachOImage, MachoOptions,
};

/// Mach-O and Darwin firmware inspector.
#[derive(Parser, Debug)]
#[command(name = "machscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect a Mach-O image
    Macho {
        /// Mach-O or FAT file
        file: PathBuf,

        /// Architecture to select from a FAT archive (e.g., "arm64e", "x86_64")
        #[arg(long)]
        arch: Option<String>,

        /// Print the header
        #[arg(short = 'H', long)]
        header: bool,

        /// Print load commands
        #[arg(short = 'l', long)]
        loads: bool,

        /// Print linked libraries
        #[arg(short = 'L', long)]
        libs: bool,

        /// Print the symbol table
        #[arg(short = 's', long)]
        symbols: bool,

        /// Print the code signature
        #[arg(short = 'S', long)]
        signature: bool,

        /// Print everything
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// Analyze a kernelcache, iBoot or SEP firmware image
    Analyze {
        /// Firmware file
        file: PathBuf,

        /// Architecture to select from a FAT archive
        #[arg(long)]
        arch: Option<String>,

        /// List embedded components
        #[arg(short, long)]
        list: bool,

        /// Extract one component by name (bundle id, payload or region name)
        #[arg(short, long)]
        extract: Option<String>,

        /// Extract every component
        #[arg(long)]
        all: bool,

        /// Dump the Mach trap table
        #[arg(short, long)]
        traps: bool,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the container format of a file
    Info {
        /// File to classify
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Macho {
            file,
            arch,
            header,
            loads,
            libs,
            symbols,
            signature,
            all,
        } => {
            let mut options = MachoOptions {
                arch,
                header,
                load_commands: loads,
                libraries: libs,
                symbols,
                code_signature: signature,
            };
            if all {
                options = options.all();
            } else if options.is_empty() {
                options.header = true;
            }
            cmd_macho(&file, options)
        }
        Commands::Analyze {
            file,
            arch,
            list,
            extract,
            all,
            traps,
            output,
        } => {
            let mut options = AnalyzeOptions {
                arch,
                list,
                extract,
                extract_all: all,
                traps,
                ..Default::default()
            };
            if let Some(dir) = output {
                options.output_dir = dir;
            }
            cmd_analyze(&file, options)
        }
        Commands::Info { file } => cmd_info(&file),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

// =============================================================================
// macho
// =============================================================================

fn cmd_macho(path: &Path, options: MachoOptions) -> Result<()> {
    let (file, container) = load_and_classify(path)
        .with_context(|| format!("Failed to open: {}", path.display()))?;
    let image = select_architecture(file.data(), &container, options.arch.as_deref())?;

    if options.header {
        print_header(&image);
    }
    if options.load_commands {
        print_load_commands(&image);
    }
    if options.libraries {
        print_libraries(&image);
    }
    if options.symbols {
        print_symbols(&image)?;
    }
    if options.code_signature {
        print_code_signature(&image)?;
    }

    Ok(())
}

fn print_header(image: &MachOImage<'_>) {
    let header = &image.header;

    println!("Mach-O Header");
    println!("=============");
    println!("Magic:        {:#010x}", header.magic);
    println!("CPU:          {}", cpu_name(header.cputype, header.cpusubtype));
    println!("File type:    {}", filetype_name(header.filetype));
    println!(
        "Commands:     {} ({} bytes)",
        header.ncmds, header.sizeofcmds
    );
    println!("Flags:        {:#x} {:?}", header.flags, header.flags());
    if let Some(uuid) = image.uuid() {
        println!("UUID:         {}", uuid.hyphenated().to_string().to_uppercase());
    }
    if let Some(build) = image.build_version() {
        println!(
            "Platform:     {} {} (SDK {})",
            platform_name(build.platform),
            format_packed_version(build.minos),
            format_packed_version(build.sdk)
        );
    }
    if let Some(version) = image.source_version() {
        println!("Source:       {}", format_source_version(version));
    }
    println!();
}

fn print_load_commands(image: &MachOImage<'_>) {
    println!("Load Commands");
    println!("=============");
    for (i, cmd) in image.load_commands.iter().enumerate() {
        println!(
            "  [{:3}] {:#010x} {:<28} {:>6}  {}",
            i,
            cmd.offset(),
            cmd.name(),
            cmd.size(),
            cmd.summary()
        );
    }
    println!();
}

fn print_libraries(image: &MachOImage<'_>) {
    println!("Libraries");
    println!("=========");
    for (name, cmd) in image.dylibs() {
        println!(
            "  {} (compatibility {}, current {})",
            name,
            format_packed_version(cmd.dylib.compatibility_version),
            format_packed_version(cmd.dylib.current_version)
        );
    }
    println!();
}

fn print_symbols(image: &MachOImage<'_>) -> Result<()> {
    let symbols = read_symbols(image).context("Failed to read symbol table")?;

    println!("Symbols ({})", symbols.len());
    println!("=======");
    for sym in &symbols {
        if let Some(stab) = sym.stab_name() {
            println!("{:016x} - {:<8} {}", sym.value, stab, sym.name);
        } else if sym.is_undefined() {
            println!("{:>16} {} {}", "", sym.type_char(image), sym.name);
        } else {
            println!("{:016x} {} {}", sym.value, sym.type_char(image), sym.name);
        }
    }
    println!();
    Ok(())
}

fn print_code_signature(image: &MachOImage<'_>) -> Result<()> {
    let signature = decode_code_signature(image).context("Failed to decode code signature")?;

    println!("Code Signature");
    println!("==============");
    println!(
        "{} ({} bytes, {} blobs)",
        blob_magic_name(signature.magic),
        signature.length,
        signature.count
    );

    for entry in &signature.blobs {
        match &entry.blob {
            Blob::CodeDirectory(cd) => print_code_directory(entry.index.slot, cd),
            Blob::Cms(cms) => {
                println!(
                    "\n  [slot {:#x}] CMS Signature ({} bytes)",
                    entry.index.slot, cms.length
                );
                for (authority, name) in cms.certificate_pairs() {
                    println!("    CA: {}", authority.unwrap_or("-"));
                    println!("    CN: {}", name);
                }
            }
            Blob::Requirements(set) => {
                println!(
                    "\n  [slot {:#x}] Requirement Set ({} bytes, {} requirements)",
                    entry.index.slot,
                    set.length,
                    set.requirements.len()
                );
                for req in &set.requirements {
                    println!("    {:<12} {}", req.kind.name(), req.text);
                }
            }
            Blob::DerEntitlements { length } => {
                println!(
                    "\n  [slot {:#x}] {} ({} bytes)",
                    entry.index.slot,
                    blob_magic_name(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS),
                    length
                );
            }
            Blob::XmlEntitlements { length } => {
                println!(
                    "\n  [slot {:#x}] {} ({} bytes)",
                    entry.index.slot,
                    blob_magic_name(CSMAGIC_EMBEDDED_ENTITLEMENTS),
                    length
                );
            }
            Blob::Unrecognized { magic } => {
                println!(
                    "\n  [slot {:#x}] unrecognized blob {:#010x}",
                    entry.index.slot, magic
                );
            }
        }
    }

    report_item_errors("code signature blob", &signature.errors);
    summarize_directories(&signature);
    println!();
    Ok(())
}

fn print_code_directory(slot: u32, cd: &CodeDirectory) {
    println!("\n  [slot {:#x}] Code Directory v{:#x}", slot, cd.version);
    println!("    Identifier:    {}", cd.identifier);
    if let Some(team) = &cd.team_id {
        println!("    Team ID:       {}", team);
    }
    println!("    Flags:         {:#x} {:?}", cd.flags.bits(), cd.flags);
    println!("    Hash:          {} ({} bytes)", cd.hash_type.name(), cd.hash_size);
    println!("    Page size:     {:#x}", cd.page_size());
    println!(
        "    Code limit:    {:#x}",
        cd.code_limit_64().unwrap_or(cd.code_limit as u64)
    );
    if cd.platform != 0 {
        println!("    Platform:      {}", cd.platform);
    }
    if let Some((base, limit, flags)) = cd.exec_segment() {
        println!(
            "    Exec segment:  base {:#x} limit {:#x} {:?}",
            base, limit, flags
        );
    }
    if let Some(runtime) = cd.runtime() {
        println!("    Runtime:       {}", format_packed_version(runtime));
    }
    println!("    Special slots: {}", cd.n_special_slots);
    for slot in &cd.special_slots {
        println!("      -{:<2} {:<24} {}", slot.slot, slot.name(), hex_string(&slot.hash));
    }
    println!("    Code slots:    {}", cd.n_code_slots);
    for (i, hash) in cd.code_hashes.iter().enumerate() {
        println!("      {:>3} {}", i, hex_string(hash));
    }
}

fn summarize_directories(signature: &CodeSignature) {
    let alternates = signature.code_directories().count().saturating_sub(1);
    if alternates > 0 {
        info!("{} alternate code directories", alternates);
    }
}

// =============================================================================
// analyze
// =============================================================================

fn cmd_analyze(path: &Path, options: AnalyzeOptions) -> Result<()> {
    let (file, container) = load_and_classify(path)
        .map(|(file, container)| (file, Some(container)))
        .or_else(|e| match e {
            // Raw iBoot and SEP images have no recognizable magic.
            Error::UnrecognizedFormat { .. } => Ok((LoadedFile::open(path)?, None)),
            other => Err(other),
        })
        .with_context(|| format!("Failed to open: {}", path.display()))?;

    let data = match &container {
        Some(container) if container.is_fat() || options.arch.is_some() => {
            select_architecture(file.data(), container, options.arch.as_deref())?.data()
        }
        _ => file.data(),
    };

    let Some(firmware) = Firmware::parse(data)
        .with_context(|| format!("Failed to decode: {}", path.display()))?
    else {
        bail!(
            "{} is not a kernelcache, iBoot or SEP firmware image",
            path.display()
        );
    };

    match &firmware {
        Firmware::Kernel(kernel) => print_kernel(kernel, &options)?,
        Firmware::Iboot(iboot) => print_iboot(iboot, options.list),
        Firmware::Sep(sep) => print_sep(sep, options.list),
    }

    if options.traps {
        match &firmware {
            Firmware::Kernel(kernel) => print_traps(kernel)?,
            _ => warn!("--traps only applies to kernelcaches"),
        }
    }

    if let Some(name) = &options.extract {
        let bytes = firmware
            .extract(name)
            .with_context(|| format!("Failed to extract: {}", name))?;
        fs::create_dir_all(&options.output_dir)?;
        let output_path = options.output_dir.join(output_file_name(name));
        fs::write(&output_path, bytes)
            .with_context(|| format!("Failed to write: {}", output_path.display()))?;
        println!("Extracted {} to {}", name, output_path.display());
    }

    if options.extract_all {
        extract_all(&firmware, &options.output_dir)?;
    }

    Ok(())
}

fn print_kernel(kernel: &KernelImage<'_>, options: &AnalyzeOptions) -> Result<()> {
    let image = kernel.kernel();

    println!("Kernelcache Information");
    println!("=======================");
    println!("Variant:      {}", kernel.variant());
    println!("CPU:          {}", cpu_name(image.header.cputype, image.header.cpusubtype));
    if let Some(version) = kernel.version() {
        if let Some(darwin) = &version.darwin {
            println!("Darwin:       {}", darwin);
        }
        if let Some(xnu) = &version.xnu {
            println!("XNU:          {}", xnu);
        }
        if let Some(time) = &version.build_time {
            println!("Built:        {}", time);
        }
        if let Some(device) = &version.device {
            println!("Device:       {}", describe_device(device));
        }
    }
    if let Some(uuid) = image.uuid() {
        println!("UUID:         {}", uuid.hyphenated().to_string().to_uppercase());
    }

    if options.list {
        let kexts = kernel.kexts().context("Failed to enumerate KEXTs")?;
        println!("\nKEXTs ({})", kexts.len());
        for kext in &kexts.kexts {
            println!(
                "  {:<60} {:<16} {:#010x} {:>8}",
                kext.name,
                kext.version,
                kext.offset,
                format_size(kext.size as u64)
            );
        }
        report_item_errors("KEXT", &kexts.errors);
    }
    Ok(())
}

fn print_iboot(iboot: &IbootImage<'_>, list: bool) {
    println!("iBoot Information");
    println!("=================");
    println!("Version:      {}", iboot.version.as_deref().unwrap_or("(unknown)"));
    println!("Device:       {}", iboot.device);
    println!("Major:        {}", iboot.major);
    println!("Base address: {:#x}", iboot.base_address);
    println!("Payloads:     {}", iboot.payloads.len());

    if list {
        println!("\nPayloads:");
        for payload in &iboot.payloads {
            println!(
                "  [{:2}] {:<5} {:<6} {:#010x}-{:#010x} {:>8} {}{}",
                payload.index,
                payload.kind,
                payload.arch,
                payload.start,
                payload.end,
                format_size(payload.size() as u64),
                payload.output_name(),
                payload
                    .address
                    .map(|a| format!(" @ {:#x}", a))
                    .unwrap_or_default()
            );
        }
    }
    report_item_errors("payload", &iboot.errors);
}

fn print_sep(sep: &SepFirmware<'_>, list: bool) {
    println!("SEP Firmware Information");
    println!("========================");
    println!("Kind:         {}", sep.kind);
    println!("Version:      {}", sep.version.as_deref().unwrap_or("(unknown)"));
    if let Some(builder) = &sep.rom_builder {
        println!("Builder:      {}", builder);
    }
    if sep.header_offset != 0 {
        println!("Header:       {:#x}", sep.header_offset);
    }
    if let Some(count) = sep.declared_apps {
        println!("Apps:         {} declared", count);
    }
    if let Err(e) = sep.apps() {
        warn!("{}", e);
    }

    if list {
        println!("\nRegions:");
        for region in sep.regions() {
            println!(
                "  {:<32} {:#010x} {:>8} {:<12} {}",
                region.output_name(),
                region.offset,
                format_size(region.size as u64),
                region.version.as_deref().unwrap_or("-"),
                region
                    .uuid
                    .map(|u| u.hyphenated().to_string().to_uppercase())
                    .unwrap_or_default()
            );
        }
    }
}

fn print_traps(kernel: &KernelImage<'_>) -> Result<()> {
    let table = kernel.mach_traps().context("Failed to locate the Mach trap table")?;

    println!("\nMach Traps");
    println!("==========");
    println!("Table:        {:#x} (file offset {:#x})", table.vmaddr, table.file_offset);
    println!("kern_invalid: {:#x}", table.kern_invalid);
    for trap in &table.traps {
        println!(
            "  {:>4}: {:#018x} {}{}",
            trap.index,
            trap.address,
            trap.name,
            if trap.thumb { " (thumb)" } else { "" }
        );
    }
    Ok(())
}

fn extract_all(firmware: &Firmware<'_>, output_dir: &Path) -> Result<()> {
    let start = Instant::now();
    let artifacts = firmware.artifacts().context("Failed to enumerate components")?;

    if artifacts.is_empty() {
        warn!("No components to extract");
        return Ok(());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create directory: {}", output_dir.display()))?;

    info!(
        "Extracting {} components to {}",
        artifacts.len(),
        output_dir.display()
    );

    let progress = ProgressBar::new(artifacts.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut errors = Vec::new();
    for artifact in &artifacts {
        let output_path = output_dir.join(output_file_name(&artifact.name));
        let result = match &artifact.data {
            Ok(bytes) => fs::write(&output_path, bytes).map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        };
        if let Err(e) = result {
            errors.push((artifact.name.as_str(), e));
        }
        progress.inc(1);
    }

    progress.finish_with_message("Done");

    if !errors.is_empty() {
        warn!("{} components failed to extract:", errors.len());
        for (name, err) in &errors {
            error!("  {}: {}", name, err);
        }
    }

    info!(
        "Extracted {}/{} components in {:.2}s",
        artifacts.len() - errors.len(),
        artifacts.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

// =============================================================================
// info
// =============================================================================

fn cmd_info(path: &Path) -> Result<()> {
    let (file, container) = load_and_classify(path)
        .with_context(|| format!("Failed to open: {}", path.display()))?;

    println!("File Information");
    println!("================");
    println!("Path:         {}", path.display());
    println!("Size:         {}", format_size(file.data().len() as u64));
    println!("Format:       {}", container);

    match &container {
        Container::Fat(archive) => {
            println!("\nArchitectures:");
            for (i, arch) in archive.arches.iter().enumerate() {
                println!(
                    "  [{:2}] {:<10} {:#010x} ({:>8}) align 2^{}",
                    i,
                    arch.name(),
                    arch.offset,
                    format_size(arch.size),
                    arch.align
                );
            }
        }
        Container::MachO { .. } => {
            let image = MachOImage::parse(file.data())?;
            println!("CPU:          {}", cpu_name(image.header.cputype, image.header.cpusubtype));
            println!("File type:    {}", filetype_name(image.header.filetype));
            if let Some(kind) = resolve_firmware_kind(file.data()) {
                println!("Firmware:     {}", kind);
            }
        }
        _ => {}
    }

    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn report_item_errors(what: &str, errors: &[ItemError]) {
    if errors.is_empty() {
        return;
    }
    warn!("{} {} entries failed to decode:", errors.len(), what);
    for item in errors {
        error!("  [{}] {}", item.index, item.error);
    }
}

/// Keeps a component name usable as a single path component.
fn output_file_name(name: &str) -> PathBuf {
    let name = name.replace(['/', '\\', '\0'], "_");
    let dots = name.len() - name.trim_start_matches('.').len();
    let name = format!("{}{}", "_".repeat(dots), &name[dots..]);
    if name.is_empty() {
        PathBuf::from("_")
    } else {
        PathBuf::from(name)
    }
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_file_name_stays_in_dir() {
        let dir = Path::new("extracted");
        for name in ["..", ".", "../kernel", "..\\kernel", "/etc/passwd", ""] {
            let path = dir.join(output_file_name(name));
            assert_eq!(path.parent(), Some(dir), "{:?}", name);
            assert!(path
                .components()
                .all(|c| matches!(c, std::path::Component::Normal(_))));
        }
        assert_eq!(output_file_name(".."), PathBuf::from("__"));
        assert_eq!(output_file_name("../x"), PathBuf::from("___x"));
        assert_eq!(
            output_file_name("com.apple.driver.AppleSMC"),
            PathBuf::from("com.apple.driver.AppleSMC")
        );
        assert_eq!(output_file_name("sepos_AppleSEPOS"), PathBuf::from("sepos_AppleSEPOS"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0K");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0M");
    }
}
