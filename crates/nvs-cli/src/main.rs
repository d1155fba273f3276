#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use nvs::{
    DeviceProbe, FileDevice, InitReport, NvStorage, PanicOnFatal, StorageConfig, StorageGeometry,
};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_LEVEL: &str = "warn";
const DUMP_WIDTH: usize = 16;

#[derive(Debug, Serialize)]
struct InspectOutput {
    device: String,
    storage_size: usize,
    line_size: usize,
    line_count: usize,
    max_write_bytes: usize,
    signature_offset: u64,
    expected_signature: String,
    found_signature: Option<String>,
    #[serde(flatten)]
    probe: DeviceProbe,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut log_level = DEFAULT_LOG_LEVEL.to_owned();
    let mut positional = Vec::new();
    let mut raw = env::args().skip(1);
    while let Some(arg) = raw.next() {
        if arg == "--log-level" {
            let Some(level) = raw.next() else {
                bail!("--log-level requires a value");
            };
            log_level = level;
        } else {
            positional.push(arg);
        }
    }
    init_logging(&log_level);

    let mut args = positional.into_iter();
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(config) = args.next() else {
                bail!("inspect requires a config path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&config), json)
        }
        "migrate" => {
            let Some(config) = args.next() else {
                bail!("migrate requires a config path");
            };
            migrate(Path::new(&config))
        }
        "dump" => {
            let Some(config) = args.next() else {
                bail!("dump requires a config path");
            };
            let offset = args.next().map(|s| parse_number(&s)).transpose()?;
            let len = args.next().map(|s| parse_number(&s)).transpose()?;
            dump(Path::new(&config), offset.unwrap_or(0), len)
        }
        "set" => {
            let (Some(config), Some(offset), Some(value)) = (args.next(), args.next(), args.next())
            else {
                bail!("set requires <config> <offset> <byte>");
            };
            let offset = parse_number(&offset)?;
            let value = u8::try_from(parse_number(&value)?)
                .with_context(|| format!("byte value out of range: {value}"))?;
            set(Path::new(&config), offset, value)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("nvs-cli\n");
    println!("USAGE:");
    println!("  nvs-cli [--log-level <level>] inspect <config> [--json]");
    println!("  nvs-cli [--log-level <level>] migrate <config>");
    println!("  nvs-cli [--log-level <level>] dump <config> [offset] [len]");
    println!("  nvs-cli [--log-level <level>] set <config> <offset> <byte>");
    println!();
    println!("RUST_LOG overrides --log-level.");
}

fn init_logging(level: &str) {
    let filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_number(text: &str) -> Result<usize> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number: {text}"))
}

fn load_config(path: &Path) -> Result<StorageConfig> {
    StorageConfig::from_json_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))
}

fn open_storage(config: &StorageConfig) -> Result<NvStorage<FileDevice>> {
    Ok(NvStorage::from_config(config)
        .context("invalid storage configuration")?
        .with_fatal_handler(PanicOnFatal))
}

fn initialized_storage(config: &StorageConfig) -> Result<NvStorage<FileDevice>> {
    let storage = open_storage(config)?;
    let report = storage.try_initialize().with_context(|| {
        format!("failed to initialize {}", config.device_path.display())
    })?;
    info!(?report, "storage initialized");
    Ok(storage)
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let storage = open_storage(&load_config(path)?)?;
    let config = storage.config();
    let probe = storage
        .probe()
        .with_context(|| format!("failed to probe {}", config.device_path.display()))?;
    let geometry: StorageGeometry = storage.geometry();

    let output = InspectOutput {
        device: config.device_path.display().to_string(),
        storage_size: geometry.storage_size(),
        line_size: geometry.line_size().bytes(),
        line_count: geometry.line_count(),
        max_write_bytes: geometry.max_write_bytes(),
        signature_offset: config.signature_offset,
        expected_signature: config.signature.to_string(),
        found_signature: probe.signature.map(|sig| sig.to_string()),
        probe,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("NvStore Inspector");
    println!("device: {}", output.device);
    println!("device_present: {}", output.probe.device_present);
    println!("storage_size: {}", output.storage_size);
    println!("line_size: {}", output.line_size);
    println!("line_count: {}", output.line_count);
    println!("max_write_bytes: {}", output.max_write_bytes);
    println!("signature_offset: {}", output.signature_offset);
    println!("expected_signature: {}", output.expected_signature);
    println!(
        "found_signature: {}",
        output.found_signature.as_deref().unwrap_or("-")
    );
    println!("signature_valid: {}", output.probe.signature_valid);
    println!("legacy_present: {}", output.probe.legacy_present);
    Ok(())
}

fn migrate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let storage = initialized_storage(&config)?;
    let report = storage
        .init_report()
        .context("initialization did not record a report")?;
    let summary = match report {
        InitReport::Current => "device already current; nothing to do".to_owned(),
        InitReport::Stamped => "fresh device stamped with format signature".to_owned(),
        InitReport::Migrated { archived } => {
            format!("legacy image migrated (legacy archived: {archived})")
        }
        InitReport::AlreadyMigrated { archived } => {
            format!("device already migrated (legacy archived: {archived})")
        }
    };
    println!("{summary}");
    Ok(())
}

fn dump(path: &Path, offset: usize, len: Option<usize>) -> Result<()> {
    let config = load_config(path)?;
    let storage = initialized_storage(&config)?;
    let size = storage.geometry().storage_size();
    let len = len.unwrap_or(size.saturating_sub(offset));
    let mut bytes = vec![0_u8; len];
    if !storage.read_block(offset, &mut bytes) {
        bail!("range {offset}+{len} is outside the {size}-byte image");
    }
    for (row, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
        println!("{}", hex_row(offset + row * DUMP_WIDTH, chunk));
    }
    Ok(())
}

fn hex_row(address: usize, chunk: &[u8]) -> String {
    let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
    let ascii: String = chunk
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { char::from(b) } else { '.' })
        .collect();
    format!(
        "{address:08x}  {:<width$}  |{ascii}|",
        hex.join(" "),
        width = DUMP_WIDTH * 3 - 1
    )
}

fn set(path: &Path, offset: usize, value: u8) -> Result<()> {
    let config = load_config(path)?;
    let storage = Arc::new(initialized_storage(&config)?);
    let size = storage.geometry().storage_size();
    if offset >= size {
        bail!("offset {offset} is outside the {size}-byte image");
    }
    storage.write_byte(offset, value);

    let mut scheduler = storage
        .flush_scheduler()
        .context("failed to attach flush scheduler")?;
    let budget = storage.geometry().line_count() + 2;
    let ticks = scheduler.drain(budget);
    let remaining = storage.dirty_line_count();
    if remaining > 0 || scheduler.sync_pending() {
        bail!("flush incomplete after {ticks} ticks ({remaining} lines still dirty)");
    }
    println!("wrote {value:#04x} at {offset} ({ticks} flush ticks)");
    Ok(())
}
