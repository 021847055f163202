//! Transports for the two scanner variants
//!
//! The direct USB variant talks to one claimed interface through
//! [`UsbBackend`] / [`UsbLink`]. The serial-bridge variant drives two
//! [`serial::SerialChannel`]s opened through a [`serial::PortOpener`].
//! Both seams are traits so the drivers can run against mocks.

pub mod libusb;
pub mod serial;

use serde::{Deserialize, Serialize};

use crate::config::UsbConfig;
use crate::error::{Result, UsbError};

/// Attached device matching the configured vendor/product id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Bus the device is attached to
    pub bus_number: u8,
    /// Device address on that bus
    pub address: u8,
}

/// An opened device with its streaming interface claimed
///
/// Shared between the caller's thread (control requests) and the capture
/// thread (bulk reads), hence `Sync`. Closing happens on drop.
pub trait UsbLink: Send + Sync + 'static {
    /// Synchronous control request; returns the number of bytes transferred
    ///
    /// # Errors
    ///
    /// Returns the libusb status of a failed transfer.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError>;

    /// Read one bulk chunk; [`UsbError::Timeout`] means nothing arrived
    ///
    /// # Errors
    ///
    /// Returns the libusb status of a failed transfer.
    fn bulk_read(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError>;

    /// Vendor and product id from the device descriptor
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the descriptor cannot be read.
    fn device_ids(&self) -> std::result::Result<(u16, u16), UsbError>;

    /// Release a claimed interface
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the interface was not claimed.
    fn release_interface(&self, interface_number: u8) -> std::result::Result<(), UsbError>;
}

/// Factory for [`UsbLink`]s
pub trait UsbBackend: Send {
    /// Link type produced by [`UsbBackend::open`]
    type Link: UsbLink;

    /// One-time library setup; calling it again is a no-op
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the library cannot be initialised.
    fn initialize(&mut self) -> std::result::Result<(), UsbError>;

    /// Attached devices with the given ids
    ///
    /// # Errors
    ///
    /// Returns the libusb status if enumeration fails.
    fn list_devices(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError>;

    /// Find, open, configure and claim the device described by `config`
    ///
    /// # Errors
    ///
    /// [`crate::ScannerError::DeviceNotFound`] if nothing matches,
    /// [`crate::ScannerError::DeviceOpenFailed`] if opening, configuring or
    /// claiming fails. Nothing stays open on failure.
    fn open(&mut self, config: &UsbConfig) -> Result<Self::Link>;
}
