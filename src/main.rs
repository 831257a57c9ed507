use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use rusty_ntfs::{FileAttributes, MountConfig, OpenMode, StreamDevice, Volume};

const USAGE: &str = "usage: rusty-ntfs <image> [--offset BYTES] [--config FILE] [-v] <info|ls|cat|stat> [path]";

/// Block size used for image files.
const IMAGE_BLOCK_SIZE: usize = 512;

static STDERR_LOGGER: StderrLogger = StderrLogger;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Args {
    image: PathBuf,
    offset: Option<u64>,
    config: Option<PathBuf>,
    verbose: bool,
    command: String,
    path: String,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut positional = Vec::new();
    let mut offset = None;
    let mut config = None;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--offset" => {
                let value = args.next().context("--offset needs a value")?;
                offset = Some(value.parse().with_context(|| format!("bad offset {value:?}"))?);
            }
            "--config" => {
                config = Some(PathBuf::from(args.next().context("--config needs a value")?));
            }
            "-v" | "--verbose" => verbose = true,
            "-V" | "--version" => {
                println!("rusty-ntfs {}", env!("APP_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(image), Some(command)) = (positional.next(), positional.next()) else {
        bail!("{USAGE}");
    };
    Ok(Args {
        image: PathBuf::from(image),
        offset,
        config,
        verbose,
        command,
        path: positional.next().unwrap_or_else(|| "\\".to_string()),
    })
}

fn main() -> Result<()> {
    let args = parse_args()?;

    if log::set_logger(&STDERR_LOGGER).is_ok() {
        log::set_max_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        });
    }

    let mut config = match &args.config {
        Some(path) => MountConfig::load_from_path(path)?,
        None => MountConfig::load(),
    };
    if let Some(offset) = args.offset {
        config.partition_offset = offset;
    }

    let file = File::open(&args.image)
        .with_context(|| format!("opening {}", args.image.display()))?;
    let device = StreamDevice::new(BufReader::new(file), IMAGE_BLOCK_SIZE);
    let volume = Volume::mount(Box::new(device), config)
        .with_context(|| format!("mounting {}", args.image.display()))?;

    match args.command.as_str() {
        "info" => {
            let info = volume.info()?;
            println!("Label:        {}", info.label);
            println!("Serial:       {:016X}", info.serial_number);
            println!("NTFS version: {}.{}", info.ntfs_version.0, info.ntfs_version.1);
            println!("Cluster size: {}", info.cluster_size);
            println!("Total size:   {}", info.total_size);
            println!("Free size:    {}", info.free_size);
            println!("Dirty:        {}", info.dirty);
        }
        "ls" => {
            for entry in volume.list_directory(&args.path)? {
                let kind = if entry.is_directory() { "<DIR>" } else { "" };
                println!(
                    "{}  {:>5} {:>12}  {}",
                    entry.modification_time,
                    kind,
                    entry.size,
                    entry.name
                );
            }
        }
        "cat" => {
            let root = volume.open_root()?;
            let mut handle = root.open(&args.path, OpenMode::READ, FileAttributes::empty())?;
            let mut stdout = io::stdout().lock();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = handle.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
            }
        }
        "stat" => {
            let info = volume.stat(&args.path)?;
            println!("Name:      {}", info.name);
            println!("Reference: {}", info.reference);
            println!("Attribute: {:?}", info.attributes);
            println!("Size:      {}", info.size);
            println!("Allocated: {}", info.physical_size);
            println!("Created:   {}", info.creation_time);
            println!("Modified:  {}", info.modification_time);
            println!("Accessed:  {}", info.access_time);
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }

    volume.unmount(true)?;
    Ok(())
}
