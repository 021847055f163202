//! `knokke-probe` - bench diagnostics for Knokke film scanners
//!
//! Lists attached scanners, reads and writes parameters, grabs one-shot
//! frames from the direct USB scanner and counts streamed frames from the
//! serial-bridge scanner.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use knokke_scanner::enumerator::{SerialEnumerator, UsbEnumerator};
use knokke_scanner::transport::libusb::LibusbBackend;
use knokke_scanner::{
    BacklightChannel, BacklightParameters, BridgeConfig, BridgeScanner, Scanner, UsbConfig,
};

#[derive(Parser, Debug)]
#[command(name = "knokke-probe")]
#[command(author, version, about = "Diagnostics for Knokke film scanners")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached scanners of both variants
    List,

    /// Read every parameter from the direct USB scanner
    Params,

    /// Write one parameter on the direct USB scanner
    Set {
        /// Parameter to write
        #[arg(value_enum)]
        parameter: Parameter,

        /// New value; for `backlight` either `R,G,B` or a single value
        value: String,

        /// Backlight channel to change alone (red, green, blue or r/g/b)
        #[arg(long)]
        channel: Option<BacklightChannel>,
    },

    /// Capture frames one at a time from the direct USB scanner
    Capture {
        /// Number of frames
        #[arg(short, long, default_value_t = 1)]
        frames: usize,
    },

    /// Count frames streamed by the serial-bridge scanner
    Stream {
        /// Base serial; the first scanner found if omitted
        #[arg(long)]
        serial: Option<String>,

        /// How long to listen
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Parameter {
    Exposure,
    Gain,
    Backlight,
    Motor,
}

fn main() -> Result<()> {
    knokke_scanner::init_logging();
    let args = Args::parse();

    match args.command {
        Command::List => list(),
        Command::Params => params(),
        Command::Set {
            parameter,
            value,
            channel,
        } => set(parameter, &value, channel),
        Command::Capture { frames } => capture(frames),
        Command::Stream { serial, seconds } => stream(serial, seconds),
    }
}

fn connect() -> Result<Scanner<LibusbBackend>> {
    let mut scanner = Scanner::with_libusb(UsbConfig::from_env());
    scanner.connect().context("Failed to connect to scanner")?;
    log::info!("{}", scanner.device_info());
    Ok(scanner)
}

fn list() -> Result<()> {
    let mut usb = UsbEnumerator::new(LibusbBackend::new(), UsbConfig::from_env());
    let devices = usb.list_candidates();
    if let Some(e) = usb.last_error() {
        log::warn!("USB scan incomplete: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);

    let serial = SerialEnumerator::system(BridgeConfig::from_env());
    let bridges = serial.list_candidates();
    if let Some(e) = serial.last_error() {
        log::warn!("Serial scan incomplete: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(&bridges)?);
    Ok(())
}

fn params() -> Result<()> {
    let scanner = connect()?;
    let params = scanner
        .get_all_parameters()
        .context("Failed to read parameters")?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn set(parameter: Parameter, value: &str, channel: Option<BacklightChannel>) -> Result<()> {
    let scanner = connect()?;
    match parameter {
        Parameter::Exposure => scanner.set_exposure_time(value.parse()?)?,
        Parameter::Gain => scanner.set_gain(value.parse()?)?,
        Parameter::Motor => scanner.set_motor_speed(value.parse()?)?,
        Parameter::Backlight => match channel {
            Some(channel) => scanner.set_backlight_channel(channel, value.parse()?)?,
            None => scanner.set_backlight(&parse_backlight(value)?)?,
        },
    }
    println!("{}", serde_json::to_string_pretty(&scanner.get_all_parameters()?)?);
    Ok(())
}

fn parse_backlight(value: &str) -> Result<BacklightParameters> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<u16>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid backlight value '{value}'"))?;
    match parts.as_slice() {
        [all] => Ok(BacklightParameters::new(*all, *all, *all)),
        [red, green, blue] => Ok(BacklightParameters::new(*red, *green, *blue)),
        _ => bail!("Backlight takes one value or R,G,B"),
    }
}

fn capture(frames: usize) -> Result<()> {
    let scanner = connect()?;
    let start = Instant::now();
    scanner.capture_frames(frames, |data, index| {
        let mean = data.iter().map(|&b| u64::from(b)).sum::<u64>() / data.len().max(1) as u64;
        println!("frame {index}: {} bytes, mean byte {mean}", data.len());
    })?;
    log::info!("Captured {} frames in {:?}", frames, start.elapsed());
    Ok(())
}

fn stream(serial: Option<String>, seconds: u64) -> Result<()> {
    let config = BridgeConfig::from_env();
    let base = match serial {
        Some(serial) => serial,
        None => SerialEnumerator::system(config.clone())
            .list_candidates()
            .into_iter()
            .next()
            .context("No serial-bridge scanner found")?,
    };

    let mut bridge = BridgeScanner::with_system_ports(config);
    bridge
        .open(&base)
        .with_context(|| format!("Failed to open bridge {base}"))?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut received = 0usize;
    while Instant::now() < deadline {
        if bridge.wait_for_frame(Duration::from_millis(200))?.is_some() {
            received += 1;
        }
        while bridge.next_frame_16bit().is_some() {}
    }

    println!(
        "{received} frames, {} bytes, {} invalid",
        bridge.total_bytes_processed(),
        bridge.frames_with_errors()
    );
    bridge.close();
    Ok(())
}
