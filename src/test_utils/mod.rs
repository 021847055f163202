//! Test utilities for the Knokke drivers
//!
//! Provides synthetic payload generation and mock transports for exercising
//! reassembly, the capture loop and both drivers without scanner hardware.

pub mod mock_serial;
pub mod mock_usb;
pub mod payload_generator;

pub use mock_serial::*;
pub use mock_usb::*;
pub use payload_generator::*;
