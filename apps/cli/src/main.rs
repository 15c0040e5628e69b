mod console;
mod keys;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use aoa_core::{BridgeConfig, BridgeSession, Parity};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use crate::console::{ConsoleObserver, CrlfWriter};
use crate::keys::RawModeGuard;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
}

impl From<ParityArg> for Parity {
    fn from(p: ParityArg) -> Self {
        match p {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
        }
    }
}

fn parse_hex_id(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB id '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Android Open Accessory to UART bridge", long_about = None)]
struct Args {
    /// Serial device path (default /dev/ttyUSB0)
    #[arg(short, long)]
    device: Option<String>,

    /// Baud rate (default 115200)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Line parity
    #[arg(long, value_enum)]
    parity: Option<ParityArg>,

    /// USB vendor id in hex, FFFF matches any Android device
    #[arg(long, value_parser = parse_hex_id)]
    vid: Option<u16>,

    /// USB product id in hex, FFFF matches any Android device
    #[arg(long, value_parser = parse_hex_id)]
    pid: Option<u16>,

    /// Echo accessory traffic back to the device instead of the serial port
    #[arg(long)]
    closed_loop: bool,

    /// Do not forward serial replies to the device
    #[arg(long)]
    no_reply: bool,

    /// Print traffic as coloured hex dumps
    #[arg(long)]
    hex: bool,

    /// Load settings from a TOML file; flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective settings to a TOML file
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(device) = &args.device {
        config.serial.path = device.clone();
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(parity) = args.parity {
        config.serial.parity = parity.into();
    }
    if let Some(vid) = args.vid {
        config.handshake.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.handshake.product_id = pid;
    }
    config.pump.closed_loop |= args.closed_loop;
    config.pump.suppress_reply |= args.no_reply;

    Ok(config)
}

fn init_tracing(verbose: bool, raw_mode: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(move || CrlfWriter::new(io::stderr(), raw_mode))
        .init();
}

fn run(args: &Args, raw_mode: bool) -> Result<()> {
    let config = build_config(args)?;
    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .with_context(|| format!("saving {}", path.display()))?;
        info!(path = %path.display(), "Configuration saved");
    }

    info!(
        serial = %config.serial.path,
        baud = config.serial.baud_rate,
        filter = ?config.handshake.filter(),
        "Starting AOA-UART bridge (nusb backend)..."
    );

    let observer = Arc::new(ConsoleObserver::new(args.hex, raw_mode));
    let mut session = BridgeSession::with_observer(config, observer);
    let shutdown = session.shutdown_signal();

    let watcher = if raw_mode {
        info!("Press q or Esc to quit");
        Some(keys::spawn_watcher(shutdown.clone()))
    } else {
        warn!("stdin is not a terminal, quit keys disabled");
        None
    };

    let result = session.run();

    shutdown.trigger();
    if let Some(handle) = watcher {
        let _ = handle.join();
    }

    result?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let raw = RawModeGuard::enable();
    init_tracing(args.verbose, raw.is_some());

    let code = match run(&args, raw.is_some()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    };
    drop(raw);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("18D1"), Ok(0x18D1));
        assert_eq!(parse_hex_id("0x2d00"), Ok(0x2D00));
        assert_eq!(parse_hex_id("ffff"), Ok(0xFFFF));
        assert!(parse_hex_id("xyz").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "aoa-uart",
            "--device",
            "/dev/ttyACM0",
            "--baud",
            "9600",
            "--parity",
            "even",
            "--vid",
            "04E8",
            "--pid",
            "6860",
            "--no-reply",
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.serial.path, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.handshake.vendor_id, 0x04E8);
        assert_eq!(config.handshake.product_id, 0x6860);
        assert!(config.pump.suppress_reply);
        assert!(!config.pump.closed_loop);
    }

    #[test]
    fn test_defaults_use_wildcard() {
        let args = Args::parse_from(["aoa-uart"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.handshake.filter(), aoa_core::DeviceFilter::Any);
    }
}
