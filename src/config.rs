//! Driver configuration for both scanner variants
//!
//! Defaults describe the shipping hardware. Individual values can be
//! overridden through `KNOKKE_*` environment variables, which is mostly useful
//! on the bench (slower timeouts, a different serial prefix, ...).

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::codec::ProbeCommitControl;

/// Sensor width in pixels
pub const FRAME_WIDTH: usize = 3840;
/// Sensor height in lines
pub const FRAME_HEIGHT: usize = 12;

/// Direct USB variant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbConfig {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Configuration value selected on connect
    pub configuration: u8,
    /// Bulk IN endpoint carrying video payloads
    pub bulk_endpoint: u8,
    /// Frame width in pixels
    pub frame_width: usize,
    /// Frame height in lines
    pub frame_height: usize,
    /// Bytes per pixel (RAW16)
    pub bytes_per_pixel: usize,
    /// Size of the buffer handed to each bulk read
    pub bulk_chunk_size: usize,
    /// Timeout for a single bulk read
    pub bulk_timeout_ms: u32,
    /// Timeout for control requests
    pub control_timeout_ms: u32,
    /// Read attempts per frame before the continuous loop gives up on it
    pub max_reads_per_frame: u32,
    /// Interfaces released on disconnect (`0..release_interfaces`)
    pub release_interfaces: u8,
    /// Streaming format index
    pub format_index: u8,
    /// Streaming frame index
    pub frame_index: u8,
    /// Frame interval in 100 ns units
    pub frame_interval: u32,
    /// Maximum payload transfer size advertised in the probe
    pub max_payload_transfer_size: u32,
    /// Device clock frequency advertised in the probe
    pub clock_frequency: u32,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x34B4,
            product_id: 0x00C3,
            configuration: 1,
            bulk_endpoint: 0x83,
            frame_width: FRAME_WIDTH,
            frame_height: FRAME_HEIGHT,
            bytes_per_pixel: 2,
            bulk_chunk_size: 32 * 1024,
            bulk_timeout_ms: 200,
            control_timeout_ms: 1000,
            max_reads_per_frame: 1000,
            release_interfaces: 8,
            format_index: 1,
            frame_index: 2,
            frame_interval: 0x0000_61A7,
            max_payload_transfer_size: 0x9000,
            clock_frequency: 384_000_000,
        }
    }
}

impl UsbConfig {
    /// Defaults with `KNOKKE_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override_hex("KNOKKE_VENDOR_ID", &mut config.vendor_id);
        env_override_hex("KNOKKE_PRODUCT_ID", &mut config.product_id);
        env_override("KNOKKE_BULK_TIMEOUT_MS", &mut config.bulk_timeout_ms);
        env_override("KNOKKE_CONTROL_TIMEOUT_MS", &mut config.control_timeout_ms);
        env_override("KNOKKE_BULK_CHUNK_SIZE", &mut config.bulk_chunk_size);
        env_override_min("KNOKKE_MAX_READS_PER_FRAME", &mut config.max_reads_per_frame, 1);
        config
    }

    /// Bytes in one complete frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_width * self.frame_height * self.bytes_per_pixel
    }

    /// Probe/commit block negotiated before streaming
    pub fn probe_control(&self) -> ProbeCommitControl {
        ProbeCommitControl {
            format_index: self.format_index,
            frame_index: self.frame_index,
            frame_interval: self.frame_interval,
            max_video_frame_size: self.frame_bytes() as u32,
            max_payload_transfer_size: self.max_payload_transfer_size,
            clock_frequency: self.clock_frequency,
            ..Default::default()
        }
    }
}

/// Serial-bridge variant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Vendor tag every scanner serial number starts with
    pub serial_prefix: String,
    /// Suffix of the image-data channel
    pub data_suffix: char,
    /// Suffix of the control channel
    pub control_suffix: char,
    /// Line rate
    pub baud_rate: u32,
    /// Read and write timeout for both channels
    pub io_timeout_ms: u64,
    /// Driver-level USB IN transfer size, in bytes
    pub usb_in_transfer_size: u32,
    /// Driver-level USB OUT transfer size, in bytes
    pub usb_out_transfer_size: u32,
    /// Size of the reader thread's read buffer
    pub read_buffer_size: usize,
    /// Sleep between empty reads
    pub idle_sleep_ms: u64,
    /// Frame width in pixels
    pub frame_width: usize,
    /// Frame height in lines
    pub frame_height: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_prefix: "SE".to_string(),
            data_suffix: 'A',
            control_suffix: 'B',
            baud_rate: 115_200,
            io_timeout_ms: 500,
            usb_in_transfer_size: 50_000_000,
            usb_out_transfer_size: 1_000,
            read_buffer_size: 500_000,
            idle_sleep_ms: 10,
            frame_width: FRAME_WIDTH,
            frame_height: FRAME_HEIGHT,
        }
    }
}

impl BridgeConfig {
    /// Defaults with `KNOKKE_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("KNOKKE_SERIAL_PREFIX", &mut config.serial_prefix);
        env_override("KNOKKE_BAUD_RATE", &mut config.baud_rate);
        env_override("KNOKKE_IO_TIMEOUT_MS", &mut config.io_timeout_ms);
        env_override("KNOKKE_READ_BUFFER_SIZE", &mut config.read_buffer_size);
        config
    }

    /// Payload bytes between the delimiters (one byte per pixel)
    pub fn frame_bytes(&self) -> usize {
        self.frame_width * self.frame_height
    }

    /// Serial number of the image-data channel for `base`
    pub fn data_serial(&self, base: &str) -> String {
        format!("{base}{}", self.data_suffix)
    }

    /// Serial number of the control channel for `base`
    pub fn control_serial(&self, base: &str) -> String {
        format!("{base}{}", self.control_suffix)
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match parse_value(&raw) {
            Some(value) => *target = value,
            None => log::warn!("Ignoring unparsable {}='{}'", key, raw),
        }
    }
}

fn env_override_hex(key: &str, target: &mut u16) {
    if let Ok(raw) = std::env::var(key) {
        match parse_u16(&raw) {
            Some(value) => *target = value,
            None => log::warn!("Ignoring unparsable {}='{}'", key, raw),
        }
    }
}

fn env_override_min(key: &str, target: &mut u32, min: u32) {
    if let Ok(raw) = std::env::var(key) {
        match parse_at_least(&raw, min) {
            Some(value) => *target = value,
            None => log::warn!("Ignoring unparsable {}='{}'", key, raw),
        }
    }
}

/// Parse a `u32`, raising values below `min` to `min`
fn parse_at_least(raw: &str, min: u32) -> Option<u32> {
    let value: u32 = parse_value(raw)?;
    if value < min {
        log::warn!("Raising {} to the minimum of {}", value, min);
    }
    Some(value.max(min))
}

fn parse_value<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// Parse a `u16` written in decimal or `0x`-prefixed hex
pub fn parse_u16(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}
