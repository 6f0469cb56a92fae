//! PMD32 CLI - work with PMD32 disk images from the command line.
//!
//! Runs the emulated controller against a directory standing in for the
//! storage medium, and drives it through the controller's own wire protocol
//! (host and engine share one process over the simulated cable).
//!
//! Usage:
//!   pmd32 --root sdcard create GAMES/FRESH
//!   pmd32 --root sdcard --mount A=system.p32,ro info
//!   pmd32 --root sdcard ls GAMES
//!   pmd32 --root sdcard --mount A=system.p32 read -d A -t 0 -s 0
//!   pmd32 --root sdcard --mount A=work.p32 write -d A -t 2 -s 5 DEADBEEF
//!   pmd32 --root sdcard --mount A=work.p32 format -d A -t 2

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use pmd32_core::geometry::SECTOR_SIZE;
use pmd32_core::{
    restore_system_image, AutoMountStore, DiskStorage, HostClient, HostError, ListEntry,
    Pmd32Engine, SimBus, Status,
};

type Engine = Pmd32Engine<SimBus, DiskStorage>;

/// PMD32 drive emulator CLI
#[derive(Parser, Debug)]
#[command(name = "pmd32")]
#[command(about = "Work with PMD32 disk images over the emulated controller")]
struct Args {
    /// Directory standing in for the storage medium
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Mount an image first: DRIVE=PATH[,ro], repeatable
    #[arg(short, long, value_name = "DRIVE=PATH[,ro]")]
    mount: Vec<String>,

    /// Auto-mount store, loaded before and saved after the command
    #[arg(long, value_name = "FILE")]
    automount: Option<PathBuf>,

    /// Engine logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Create a blank 360K image (.p32 appended when missing)
    Create {
        /// Name relative to the medium root
        name: String,
    },
    /// Show the drive table and image geometry
    Info,
    /// List a directory of the medium
    Ls {
        /// Directory relative to the root; defaults to the root itself
        path: Option<String>,
    },
    /// Hex-dump the boot sector (drive A, track 0, sector 0)
    Boot,
    /// Hex-dump one logical sector
    Read {
        #[arg(short, long)]
        drive: char,
        #[arg(short, long)]
        track: u8,
        #[arg(short, long)]
        sector: u8,
    },
    /// Write one logical sector; hex bytes, zero-padded to 128
    Write {
        #[arg(short, long)]
        drive: char,
        #[arg(short, long)]
        track: u8,
        #[arg(short, long)]
        sector: u8,
        /// Payload as hex digits, e.g. DEADBEEF
        hex: String,
    },
    /// Format one track (fills it with 0xE5)
    Format {
        #[arg(short, long)]
        drive: char,
        #[arg(short, long)]
        track: u8,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let (bus, host) = SimBus::pair();
    let mut engine = Engine::new(bus, DiskStorage::new(&args.root));
    let mut client = HostClient::new(host);

    if let Some(store_path) = &args.automount {
        if store_path.exists() {
            let store = AutoMountStore::load(store_path)
                .with_context(|| format!("loading auto-mount store {}", store_path.display()))?;
            let mut probe = DiskStorage::new(&args.root);
            let mounted = store.restore(&mut probe, engine.drives_mut());
            if mounted > 0 {
                eprintln!("auto-mounted {mounted} drive(s)");
            }
        }
    }
    {
        let mut probe = DiskStorage::new(&args.root);
        restore_system_image(&mut probe, engine.drives_mut());
    }

    for spec in &args.mount {
        apply_mount(&mut engine, spec)?;
    }

    match &args.command {
        CliCommand::Create { name } => {
            client
                .create_image(&mut engine, name)
                .map_err(describe)
                .with_context(|| format!("creating {name}"))?;
            println!("created {name}");
        }

        CliCommand::Info => {
            for drive in 0..4u8 {
                let letter = (b'A' + drive) as char;
                let (wp, path) = client.get_image_path(&mut engine, drive).map_err(describe)?;
                if path.is_empty() {
                    println!("{letter}: (not mounted)");
                    continue;
                }
                let (tracks, sectors, phys) =
                    client.image_info(&mut engine, drive).map_err(describe)?;
                println!(
                    "{letter}: {path}{ro} - {tracks} tracks, {sectors} sectors/track, {size}B physical",
                    ro = if wp { " (read-only)" } else { "" },
                    size = 128u16 << phys,
                );
            }
        }

        CliCommand::Ls { path } => {
            if let Some(path) = path {
                client
                    .change_cwd(&mut engine, path)
                    .map_err(describe)
                    .with_context(|| format!("entering {path}"))?;
            }
            let cwd = client.get_cwd(&mut engine).map_err(describe)?;
            println!("/{cwd}");
            let mut reset = true;
            loop {
                match client.list_dir(&mut engine, reset).map_err(describe)? {
                    ListEntry::Name(name) => println!("  {name}"),
                    ListEntry::End => break,
                }
                reset = false;
            }
        }

        CliCommand::Boot => {
            let payload = client.read_boot(&mut engine).map_err(describe)?;
            hex_dump(&payload);
        }

        CliCommand::Read {
            drive,
            track,
            sector,
        } => {
            let drive = drive_index(*drive)?;
            let payload = client
                .read_sector(&mut engine, drive, *track, *sector)
                .map_err(describe)?;
            hex_dump(&payload);
        }

        CliCommand::Write {
            drive,
            track,
            sector,
            hex,
        } => {
            let drive = drive_index(*drive)?;
            let bytes = parse_hex(hex)?;
            if bytes.len() > SECTOR_SIZE {
                bail!("payload is {} bytes, a logical sector holds {SECTOR_SIZE}", bytes.len());
            }
            let mut payload = [0u8; SECTOR_SIZE];
            payload[..bytes.len()].copy_from_slice(&bytes);
            client
                .write_sector(&mut engine, drive, *track, *sector, &payload)
                .map_err(describe)?;
            println!("wrote {} bytes (zero-padded to {SECTOR_SIZE})", bytes.len());
        }

        CliCommand::Format { drive, track } => {
            let drive = drive_index(*drive)?;
            client
                .format_track(&mut engine, drive, *track)
                .map_err(describe)?;
            println!("formatted track {track}");
        }
    }

    if let Some(store_path) = &args.automount {
        AutoMountStore::capture(engine.drives_mut())
            .save(store_path)
            .with_context(|| format!("saving auto-mount store {}", store_path.display()))?;
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "pmd32_core=debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Mount specs look like `A=games/disk.p32` or `B=work.p32,ro`.
fn apply_mount(engine: &mut Engine, spec: &str) -> Result<()> {
    let (letter, rest) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("mount spec must look like A=path[,ro]: {spec}"))?;
    let letter = letter
        .chars()
        .next()
        .ok_or_else(|| anyhow!("empty drive letter in {spec}"))?;
    let drive = drive_index(letter)?;
    let (path, read_only) = match rest.strip_suffix(",ro") {
        Some(path) => (path, true),
        None => (rest, false),
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    tracing::debug!(%path, drive, read_only, "mounting from the command line");
    engine
        .mount_drive(drive, &path, read_only)
        .with_context(|| format!("mounting {path} on {letter}"))?;
    Ok(())
}

fn drive_index(letter: char) -> Result<u8> {
    match letter.to_ascii_uppercase() {
        letter @ 'A'..='D' => Ok(letter as u8 - b'A'),
        other => bail!("no such drive: {other} (use A to D)"),
    }
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|at| {
            u8::from_str_radix(&digits[at..at + 2], 16)
                .map_err(|_| anyhow!("bad hex byte at offset {at}"))
        })
        .collect()
}

/// Result-byte names for protocol-level failures.
fn describe(err: HostError) -> anyhow::Error {
    if let HostError::Failed(code) = err {
        let name = match code {
            code if code == Status::WriteProtect.as_byte() => "write protected",
            code if code == Status::FormatError.as_byte() => "format error",
            code if code == Status::ReadError.as_byte() => "read error",
            code if code == Status::WriteError.as_byte() => "write error",
            code if code == Status::InvalidDrive.as_byte() => "invalid drive",
            code if code == Status::PathNotFound.as_byte() => "path not found",
            code if code == Status::PathTooLong.as_byte() => "path too long",
            code if code == Status::CreateError.as_byte() => "create error",
            code if code == Status::ImageUnknown.as_byte() => "not a 360K image",
            0x99 => "refused (NAK)",
            _ => return anyhow!("result code {code}"),
        };
        return anyhow!("{name}");
    }
    anyhow!(err)
}

fn hex_dump(payload: &[u8]) {
    for (row, chunk) in payload.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02X}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&byte| {
                if (0x20..0x7F).contains(&byte) {
                    byte as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:04X}  {:<47}  {ascii}", row * 16, hex.join(" "));
    }
}
