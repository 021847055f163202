//! `knokke-scanner` - USB transport, frame reassembly and parameter control
//! for Knokke film scanners
//!
//! Two hardware variants are supported:
//!
//! - [`Scanner`] drives the current scanner, a video-class device read
//!   through one bulk endpoint. Frames are 3840x12 samples of 16 bits,
//!   reassembled from header-prefixed chunks. Exposure, gain, RGB backlight
//!   and motor speed are class control requests.
//! - [`BridgeScanner`] drives the legacy scanner behind a dual-channel
//!   USB-to-serial bridge. Frames are 3840x12 bytes wrapped in start/end
//!   delimiters on the data channel; the control channel is raw bytes.
//!
//! Everything that happens on a background thread reaches the caller through
//! callbacks or queues; every synchronous call returns [`Result`].

pub mod bridge;
pub mod capture;
pub mod codec;
pub mod config;
pub mod delimiter;
pub mod enumerator;
pub mod error;
pub mod frame;
pub mod frame_assembler;
pub mod params;
pub mod scanner;
pub mod test_utils;
pub mod transport;

pub use bridge::BridgeScanner;
pub use config::{BridgeConfig, UsbConfig};
pub use enumerator::{SerialEnumerator, UsbEnumerator};
pub use error::{ErrorCode, Result, ScannerError, UsbError};
pub use frame::{convert_16bit_to_8bit, convert_8bit_to_16bit, Frame, Frame16};
pub use params::{BacklightChannel, BacklightParameters, ScannerParameters};
pub use scanner::{ConnectionState, Scanner};

/// Initialise `env_logger` with an `info` default, overridable via `RUST_LOG`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
