use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use maskrom_core::protocol::pretty_size;
use maskrom_core::{MaskromDevice, SessionConfig, idb, list_maskrom_devices};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rockchip maskrom USB boot tool", long_about = None)]
struct Args {
    /// Which enumerated maskrom device to talk to
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Per-transfer timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Load session settings from a TOML file (overrides --index/--timeout-ms)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices currently in maskrom mode
    List,
    /// Query chip identity, flash geometry and capability flags
    Info,
    /// Read LBA sectors into a file
    ReadLba {
        #[arg(long, value_parser = parse_u32)]
        sector: u32,
        #[arg(long, value_parser = parse_u32)]
        count: u32,
        #[arg(long)]
        out: PathBuf,
    },
    /// Read raw sectors including out-of-band bytes into a file
    ReadSector {
        #[arg(long, value_parser = parse_u32)]
        sector: u32,
        #[arg(long, value_parser = parse_u32)]
        count: u32,
        #[arg(long)]
        out: PathBuf,
    },
    /// Read device RAM into a file
    ReadSdram {
        #[arg(long, value_parser = parse_u32)]
        address: u32,
        #[arg(long, value_parser = parse_u32)]
        size: u32,
        #[arg(long)]
        out: PathBuf,
    },
    /// Push boot images into on-chip RAM
    Load {
        /// First-stage image for the SRAM slot (DDR init)
        #[arg(long)]
        sram: Option<PathBuf>,
        /// Second-stage image for the DRAM slot (usbplug)
        #[arg(long)]
        dram: Option<PathBuf>,
        /// Skip the ROM cipher obfuscation
        #[arg(long)]
        no_encrypt: bool,
    },
    /// Reset the device
    Reset {
        #[arg(long, default_value_t = 0)]
        subcode: u8,
    },
    /// Scan a raw dump file for Initial Data Blocks
    ScanIdb {
        image: PathBuf,
        /// Write recovered payloads into this directory
        #[arg(long)]
        extract: Option<PathBuf>,
    },
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig {
            device_index: args.index,
            timeout_ms: args.timeout_ms,
            ..Default::default()
        },
    };

    match args.command {
        Command::List => list(),
        Command::Info => info_cmd(&config),
        Command::ReadLba { sector, count, out } => {
            let device = open(&config)?;
            dump(device.read_lba(sector, count), &out)
        }
        Command::ReadSector { sector, count, out } => {
            let device = open(&config)?;
            dump(device.read_sector(sector, count), &out)
        }
        Command::ReadSdram { address, size, out } => {
            let device = open(&config)?;
            dump(device.read_sdram(address, size), &out)
        }
        Command::Load {
            sram,
            dram,
            no_encrypt,
        } => load(&config, sram, dram, no_encrypt),
        Command::Reset { subcode } => {
            let device = open(&config)?;
            println!("reset: {}", device.device_reset(subcode)?);
            Ok(())
        }
        Command::ScanIdb { image, extract } => scan_idb(&image, extract.as_deref()),
    }
}

fn open(config: &SessionConfig) -> Result<MaskromDevice> {
    Ok(MaskromDevice::open_with_config(config)?)
}

fn list() -> Result<()> {
    let devices = list_maskrom_devices()?;
    if devices.is_empty() {
        println!("no maskrom devices found");
        return Ok(());
    }
    for (i, dev) in devices.iter().enumerate() {
        println!(
            "{i}: {:04x}:{:04x} {} (bus {} addr {})",
            dev.vid,
            dev.pid,
            dev.family.unwrap_or("unknown"),
            dev.bus,
            dev.address
        );
    }
    Ok(())
}

fn info_cmd(config: &SessionConfig) -> Result<()> {
    let device = open(config)?;
    println!("ready:      {}", device.test_unit_ready()?);
    println!("chip:       {}", device.read_chip_info()?);
    println!("flash id:   {}", device.read_flash_id()?);
    println!("flash:      {}", device.read_flash_info()?);
    println!("capability: {}", device.read_capability()?);
    Ok(())
}

fn dump<I>(windows: I, out: &PathBuf) -> Result<()>
where
    I: Iterator<Item = Result<Vec<u8>, maskrom_core::SessionError>>,
{
    use std::io::Write;

    let mut file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let mut total = 0usize;
    for chunk in windows {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        total += chunk.len();
    }
    info!(bytes = total, path = %out.display(), "Dump complete");
    println!("wrote {} to {}", pretty_size(total as u64), out.display());
    Ok(())
}

fn load(
    config: &SessionConfig,
    sram: Option<PathBuf>,
    dram: Option<PathBuf>,
    no_encrypt: bool,
) -> Result<()> {
    if sram.is_none() && dram.is_none() {
        bail!("nothing to load: pass --sram and/or --dram");
    }
    let mut config = config.clone();
    if no_encrypt {
        config.encrypt = false;
    }
    let device = open(&config)?;
    if let Some(path) = sram {
        let image = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        device.load_sram(&image)?;
        println!("loaded {} into SRAM", path.display());
    }
    if let Some(path) = dram {
        let image = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        device.load_dram(&image)?;
        println!("loaded {} into DRAM", path.display());
    }
    Ok(())
}

fn scan_idb(image: &PathBuf, extract: Option<&std::path::Path>) -> Result<()> {
    let file = File::open(image).with_context(|| format!("opening {}", image.display()))?;
    let mut found = 0usize;
    for item in idb::scan(file) {
        match item {
            Ok(recovered) => {
                found += 1;
                println!(
                    "idb at block {}: {:?}, {} entries",
                    recovered.header.block,
                    recovered.header.hash_kind,
                    recovered.entries.len()
                );
                for entry in &recovered.entries {
                    match &entry.payload {
                        Ok(payload) => {
                            println!(
                                "  counter {} offset {} blocks {} ({})",
                                entry.entry.counter,
                                entry.entry.offset,
                                entry.entry.blocks,
                                pretty_size(payload.len() as u64)
                            );
                            if let Some(dir) = extract {
                                std::fs::create_dir_all(dir)?;
                                let name = dir.join(format!(
                                    "idb{}_counter{}.bin",
                                    recovered.header.block, entry.entry.counter
                                ));
                                std::fs::write(&name, payload)?;
                                println!("  extracted to {}", name.display());
                            }
                        }
                        Err(e) => println!("  counter {} invalid: {e}", entry.entry.counter),
                    }
                }
            }
            Err(e) => println!("rejected candidate: {e}"),
        }
    }
    println!("{found} valid idb structure(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_decimal_arguments() {
        assert_eq!(parse_u32("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_u32("4096").unwrap(), 4096);
        assert!(parse_u32("0xZZ").is_err());
    }
}
