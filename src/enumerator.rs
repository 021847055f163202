//! Device discovery for both scanner variants
//!
//! Enumeration never fails outright: an error yields an empty list and is
//! kept for [`SerialEnumerator::last_error`] / [`UsbEnumerator::last_error`],
//! so "nothing attached" and "could not look" are told apart only there.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::{BridgeConfig, UsbConfig};
use crate::error::{Result, ScannerError};
use crate::transport::{UsbBackend, UsbDeviceInfo};

/// One serial-bridge channel as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeChannelInfo {
    /// USB serial number of the channel (base serial plus `A`/`B`)
    pub serial_number: String,
    /// OS device path
    pub port_name: String,
    /// Product string, when the OS reports one
    pub description: Option<String>,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
}

/// Source of attached serial-bridge channels
pub trait SerialSource: Send + Sync {
    /// Every USB serial channel currently attached
    ///
    /// # Errors
    ///
    /// Returns the enumeration failure.
    fn channels(&self) -> Result<Vec<BridgeChannelInfo>>;
}

/// [`SerialSource`] backed by the system port list
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialSource;

impl SerialSource for SystemSerialSource {
    fn channels(&self) -> Result<Vec<BridgeChannelInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(BridgeChannelInfo {
                    serial_number: usb.serial_number?,
                    port_name: port.port_name,
                    description: usb.product,
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                }),
                _ => None,
            })
            .collect())
    }
}

/// Base serials of the bridges among `serials`
///
/// A serial counts only if it ends in one of `suffixes`; the suffix is
/// stripped and the remainder kept if it starts with `prefix`. The result is
/// sorted and free of duplicates.
pub fn group_base_serials<I, S>(serials: I, prefix: &str, suffixes: &[char]) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let bases: BTreeSet<String> = serials
        .into_iter()
        .filter_map(|serial| {
            let serial = serial.as_ref();
            let last = serial.chars().last()?;
            if !suffixes.contains(&last) {
                return None;
            }
            let base = &serial[..serial.len() - last.len_utf8()];
            base.starts_with(prefix).then(|| base.to_string())
        })
        .collect();
    bases.into_iter().collect()
}

fn remember(slot: &Mutex<Option<String>>, outcome: Option<String>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
}

/// Finds serial-bridge scanners by serial number
#[derive(Debug)]
pub struct SerialEnumerator<S: SerialSource = SystemSerialSource> {
    source: S,
    config: BridgeConfig,
    last_error: Mutex<Option<String>>,
}

impl SerialEnumerator<SystemSerialSource> {
    /// Enumerator over the system port list
    pub fn system(config: BridgeConfig) -> Self {
        Self::new(SystemSerialSource, config)
    }
}

impl<S: SerialSource> SerialEnumerator<S> {
    /// Enumerator over `source`
    pub fn new(source: S, config: BridgeConfig) -> Self {
        Self {
            source,
            config,
            last_error: Mutex::new(None),
        }
    }

    /// Every attached channel; empty if enumeration failed
    pub fn channels(&self) -> Vec<BridgeChannelInfo> {
        match self.source.channels() {
            Ok(channels) => {
                remember(&self.last_error, None);
                channels
            }
            Err(e) => {
                log::warn!("Serial enumeration failed: {}", e);
                remember(&self.last_error, Some(e.to_string()));
                Vec::new()
            }
        }
    }

    /// Serial numbers of every attached channel
    pub fn serial_numbers(&self) -> Vec<String> {
        self.channels()
            .into_iter()
            .map(|channel| channel.serial_number)
            .collect()
    }

    /// Base serials of the attached scanners, sorted and deduplicated
    pub fn unique_base_serials(&self) -> Vec<String> {
        group_base_serials(
            self.serial_numbers(),
            &self.config.serial_prefix,
            &[self.config.data_suffix, self.config.control_suffix],
        )
    }

    /// Scanners that can be passed to [`crate::BridgeScanner::open`]
    pub fn list_candidates(&self) -> Vec<String> {
        let candidates = self.unique_base_serials();
        log::debug!("Serial-bridge candidates: {:?}", candidates);
        candidates
    }

    /// The attached channel whose serial number is exactly `serial`
    pub fn channel_by_serial(&self, serial: &str) -> Option<BridgeChannelInfo> {
        self.channels()
            .into_iter()
            .find(|channel| channel.serial_number == serial)
    }

    /// Whether a channel with exactly this serial number is attached
    pub fn is_device_connected(&self, serial_number: &str) -> bool {
        self.serial_numbers()
            .iter()
            .any(|serial| serial == serial_number)
    }

    /// Error from the most recent enumeration, if it failed
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Finds direct USB scanners by vendor/product id
#[derive(Debug)]
pub struct UsbEnumerator<B: UsbBackend> {
    backend: B,
    config: UsbConfig,
    last_error: Mutex<Option<String>>,
}

impl<B: UsbBackend> UsbEnumerator<B> {
    /// Enumerator over `backend`
    pub fn new(backend: B, config: UsbConfig) -> Self {
        Self {
            backend,
            config,
            last_error: Mutex::new(None),
        }
    }

    /// Attached devices matching the configured ids; empty on failure
    pub fn list_candidates(&mut self) -> Vec<UsbDeviceInfo> {
        let result = self
            .backend
            .initialize()
            .and_then(|()| {
                self.backend
                    .list_devices(self.config.vendor_id, self.config.product_id)
            })
            .map_err(ScannerError::Usb);
        match result {
            Ok(devices) => {
                remember(&self.last_error, None);
                devices
            }
            Err(e) => {
                log::warn!("USB enumeration failed: {}", e);
                remember(&self.last_error, Some(e.to_string()));
                Vec::new()
            }
        }
    }

    /// Error from the most recent enumeration, if it failed
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockUsbBackend;

    struct FixedSource(Result<Vec<&'static str>>);

    impl SerialSource for FixedSource {
        fn channels(&self) -> Result<Vec<BridgeChannelInfo>> {
            match &self.0 {
                Ok(serials) => Ok(serials
                    .iter()
                    .map(|serial| BridgeChannelInfo {
                        serial_number: serial.to_string(),
                        port_name: format!("/dev/tty{serial}"),
                        description: None,
                        vendor_id: 0x0403,
                        product_id: 0x6010,
                    })
                    .collect()),
                Err(_) => Err(ScannerError::Unknown("bus scan failed".to_string())),
            }
        }
    }

    #[test]
    fn test_group_base_serials() {
        let serials = ["SE02B", "SE01A", "SE01B", "SE02A", "XY03A", "SE04", "SE05C", ""];
        assert_eq!(
            group_base_serials(serials, "SE", &['A', 'B']),
            vec!["SE01".to_string(), "SE02".to_string()]
        );
    }

    #[test]
    fn test_unique_base_serials_from_source() {
        let enumerator = SerialEnumerator::new(
            FixedSource(Ok(vec!["SE9B", "SE9A", "FT1A"])),
            BridgeConfig::default(),
        );
        assert_eq!(enumerator.list_candidates(), vec!["SE9".to_string()]);
        assert!(enumerator.is_device_connected("SE9A"));
        assert!(!enumerator.is_device_connected("SE9"));
        assert_eq!(enumerator.last_error(), None);
    }

    #[test]
    fn test_channel_by_serial() {
        let enumerator = SerialEnumerator::new(
            FixedSource(Ok(vec!["SE7A", "SE7B"])),
            BridgeConfig::default(),
        );
        let channel = enumerator.channel_by_serial("SE7B").unwrap();
        assert_eq!(channel.serial_number, "SE7B");
        assert_eq!(channel.port_name, "/dev/ttySE7B");
        assert_eq!(enumerator.channel_by_serial("SE7"), None);
        assert_eq!(enumerator.channel_by_serial("SE8A"), None);
    }

    #[test]
    fn test_enumeration_error_is_silent() {
        let enumerator = SerialEnumerator::new(
            FixedSource(Err(ScannerError::DeviceNotFound)),
            BridgeConfig::default(),
        );
        assert!(enumerator.serial_numbers().is_empty());
        assert!(enumerator
            .last_error()
            .is_some_and(|e| e.contains("bus scan failed")));
    }

    #[test]
    fn test_usb_candidates() {
        let backend = MockUsbBackend::new();
        let device = backend.device();
        let mut enumerator = UsbEnumerator::new(backend, UsbConfig::default());

        let found = enumerator.list_candidates();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vendor_id, 0x34B4);
        assert_eq!(found[0].product_id, 0x00C3);

        device.set_present(false);
        assert!(enumerator.list_candidates().is_empty());
        assert_eq!(enumerator.last_error(), None);
    }
}
