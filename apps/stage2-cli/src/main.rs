use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stage2_core::crypto::RawMode;
use stage2_core::events::TracingObserver;
use stage2_core::session::{PreloaderDump, SessionConfig, Stage2Session};
use stage2_core::storage::{FileSink, Sink};
use stage2_core::transport::NusbTransport;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "MediaTek stage2 agent client", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for dumped artifacts
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// USB vendor ID (hex)
    #[arg(long, value_parser = parse_hex16)]
    vid: Option<u16>,

    /// USB product ID (hex)
    #[arg(long, value_parser = parse_hex16)]
    pid: Option<u16>,

    /// Extra chip table (TOML, [[chip]] entries)
    #[arg(long)]
    chips: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the RPMB area
    DumpRpmb {
        /// Bytes to dump (defaults to the configured RPMB size)
        #[arg(short, long, value_parser = parse_num)]
        length: Option<u64>,
        /// Byte-reverse every 256-byte block
        #[arg(short, long)]
        reverse: bool,
        #[arg(long, default_value = "rpmb.bin")]
        out: String,
    },
    /// Dump the preloader from boot1
    DumpPreloader,
    /// Dump the start of boot2
    DumpBoot2 {
        #[arg(short, long, value_parser = parse_num, default_value = "0x400000")]
        length: u64,
        #[arg(long, default_value = "boot2.bin")]
        out: String,
    },
    /// Read device memory
    ReadMem {
        #[arg(value_parser = parse_hex32)]
        address: u32,
        #[arg(value_parser = parse_num)]
        length: u64,
        /// Write to a file instead of printing hex
        #[arg(long)]
        out: Option<String>,
    },
    /// Write device memory
    WriteMem {
        #[arg(value_parser = parse_hex32)]
        address: u32,
        /// Hex bytes to write
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,
        /// File whose contents are written
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Derive hardware keys and read device identifiers
    ExtractKeys {
        /// Seed for the legacy engine (hex)
        #[arg(long, default_value = "")]
        seed: String,
        /// OTP value (hex)
        #[arg(long)]
        otp: Option<String>,
    },
    /// Run one raw engine operation
    Crypto {
        /// sej_aes_decrypt, sej_aes_encrypt or dxcc_sha256
        #[arg(long)]
        mode: String,
        /// Input bytes (hex)
        data: String,
    },
    /// Reboot the device
    Reboot,
    /// Build a sealed seccfg image
    Seccfg {
        /// unlock or lock
        flag: String,
        /// Seal in software instead of on the engine
        #[arg(long)]
        sw: bool,
    },
}

fn parse_num(input: &str) -> Result<u64, std::num::ParseIntError> {
    match input.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

fn parse_hex32(input: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(input.strip_prefix("0x").unwrap_or(input), 16)
}

fn parse_hex16(input: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(input.strip_prefix("0x").unwrap_or(input), 16)
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
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.display().to_string();
    }
    if args.vid.is_some() {
        config.vid = args.vid;
    }
    if args.pid.is_some() {
        config.pid = args.pid;
    }
    if let Some(chips) = &args.chips {
        config.chip_table_path = Some(chips.display().to_string());
    }
    Ok(config)
}

fn decode_hex(label: &str, input: &str) -> Result<Vec<u8>> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(trimmed).with_context(|| format!("{} is not valid hex", label))
}

fn write_artifact(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, data).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = data.len(), "Saved");
    Ok(path)
}

type Session = Stage2Session<NusbTransport, TracingObserver>;

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let out_dir = PathBuf::from(&config.output_dir);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    info!("Starting stage2 client (nusb backend)...");
    let mut session: Session = Stage2Session::open(config, Arc::new(TracingObserver))?;
    let chip = session.connect()?;
    info!(chip = %chip.name, hw_code = %format!("0x{:04X}", chip.hw_code), "Connected");

    match args.command {
        Command::DumpRpmb {
            length,
            reverse,
            out,
        } => {
            let path = out_dir.join(&out);
            let mut sink = FileSink::create(&path)?;
            let written = session.dump_rpmb(length, reverse, &mut sink)?;
            info!(path = %path.display(), bytes = written, "RPMB dumped");
        }
        Command::DumpPreloader => match session.dump_preloader()? {
            PreloaderDump::Structured {
                name,
                header_name,
                header,
                payload,
            } => {
                write_artifact(&out_dir, &name, &payload)?;
                write_artifact(&out_dir, &header_name, &header)?;
            }
            PreloaderDump::Flat { data } => {
                warn!("No preloader layout found, saved raw boot1 area");
                write_artifact(&out_dir, "boot1.bin", &data)?;
            }
        },
        Command::DumpBoot2 { length, out } => {
            let data = session.dump_boot2(length)?;
            write_artifact(&out_dir, &out, &data)?;
        }
        Command::ReadMem {
            address,
            length,
            out,
        } => match out {
            Some(name) => {
                let path = out_dir.join(name);
                let mut sink = FileSink::create(&path)?;
                session.read_memory_to(address, length, &mut sink)?;
                info!(path = %path.display(), bytes = sink.written(), "Memory saved");
            }
            None => {
                let data = session.read_memory(address, length as usize)?;
                for (i, line) in data.chunks(16).enumerate() {
                    println!("{:08X}: {}", address as u64 + i as u64 * 16, hex::encode(line));
                }
            }
        },
        Command::WriteMem {
            address,
            data,
            file,
        } => match (data, file) {
            (Some(hex_data), _) => {
                let bytes = decode_hex("data", &hex_data)?;
                session.write_memory(address, &bytes)?;
                info!(bytes = bytes.len(), "Memory written");
            }
            (None, Some(path)) => {
                let length = fs::metadata(&path)
                    .with_context(|| format!("reading {}", path.display()))?
                    .len();
                let mut source = File::open(&path)?;
                session.write_memory_from(address, &mut source, length)?;
                info!(bytes = length, "Memory written");
            }
            (None, None) => anyhow::bail!("either --data or --file is required"),
        },
        Command::ExtractKeys { seed, otp } => {
            let seed = decode_hex("seed", &seed)?;
            let otp = otp.map(|o| decode_hex("otp", &o)).transpose()?;
            let keys = session.extract_keys(&seed, otp.as_deref())?;
            for (stem, bytes) in keys.entries() {
                write_artifact(&out_dir, &format!("{}.txt", stem), hex::encode(bytes).as_bytes())?;
            }
            print!("{}", keys);
        }
        Command::Crypto { mode, data } => {
            let mode: RawMode = mode.parse()?;
            let input = decode_hex("data", &data)?;
            let output = session.crypto_passthrough(mode, &input)?;
            println!("{}", hex::encode(output));
        }
        Command::Reboot => session.reboot()?,
        Command::Seccfg { flag, sw } => {
            let image = session.generate_seccfg(&flag, sw)?;
            write_artifact(&out_dir, "seccfg.bin", &image)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_parsers() {
        assert_eq!(parse_num("0x400").unwrap(), 0x400);
        assert_eq!(parse_num("512").unwrap(), 512);
        assert_eq!(parse_hex32("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_hex32("1000").unwrap(), 0x1000);
        assert_eq!(parse_hex16("0E8D").unwrap(), 0x0E8D);
        assert!(parse_num("0xZZ").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from(["stage2", "-v", "dump-rpmb", "--reverse"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(
            args.command,
            Command::DumpRpmb {
                length: None,
                reverse: true,
                ..
            }
        ));

        let args = Args::try_parse_from(["stage2", "seccfg", "unlock", "--sw"]).unwrap();
        assert!(matches!(args.command, Command::Seccfg { sw: true, .. }));

        assert!(Args::try_parse_from(["stage2", "write-mem", "0x100"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "stage2",
            "--vid",
            "0e8d",
            "--pid",
            "2000",
            "-o",
            "out",
            "reboot",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.vid, Some(0x0E8D));
        assert_eq!(config.pid, Some(0x2000));
        assert_eq!(config.output_dir, "out");
    }
}
