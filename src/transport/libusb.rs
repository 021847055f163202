//! libusb-backed direct USB transport
//!
//! Safe wrappers around the libusb FFI bindings: a context, a device list,
//! and a device handle that claims the scanner's streaming interface.
//!
//! Connecting walks the attached devices for the configured vendor/product
//! id, opens the first match, makes sure the wanted configuration is active,
//! then scans every interface, alternate setting and endpoint for the bulk IN
//! endpoint that carries video payloads and claims its interface.

use std::ptr;
use std::sync::Arc;

use super::{UsbBackend, UsbDeviceInfo, UsbLink};
use crate::config::UsbConfig;
use crate::error::{Result, ScannerError, UsbError};

/// libusb result to `Result`
fn check(ret: i32) -> std::result::Result<i32, UsbError> {
    if ret < 0 {
        Err(UsbError::from(ret))
    } else {
        Ok(ret)
    }
}

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Control
    Control = 0,
    /// Isochronous
    Isochronous = 1,
    /// Bulk
    Bulk = 2,
    /// Interrupt
    Interrupt = 3,
}

impl TransferType {
    /// Transfer type from `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Whether an endpoint descriptor is the bulk endpoint at `address`
///
/// Only the direction bit and endpoint number take part in the comparison.
pub fn is_bulk_endpoint(endpoint_address: u8, attributes: u8, address: u8) -> bool {
    (endpoint_address & 0x8F) == (address & 0x8F)
        && TransferType::from_attributes(attributes) == TransferType::Bulk
}

/// Location of the streaming endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// `bEndpointAddress`, direction bit included
    pub address: u8,
    /// `wMaxPacketSize` with the multiplier bits masked off
    pub max_packet_size: u16,
    /// Owning interface
    pub interface_number: u8,
    /// Alternate setting the endpoint lives in
    pub alt_setting: u8,
}

/// Pass `result` through, calling `reattach` first if it failed after a
/// kernel driver was detached
fn restore_on_error<T>(
    detached: bool,
    result: std::result::Result<T, UsbError>,
    reattach: impl FnOnce(),
) -> std::result::Result<T, UsbError> {
    if result.is_err() && detached {
        reattach();
    }
    result
}

/// Owned `libusb_context`, shared by every handle opened from it
pub struct LibusbContext {
    ctx: *mut libusb1_sys::libusb_context,
}

// SAFETY: libusb contexts are thread-safe
unsafe impl Send for LibusbContext {}
unsafe impl Sync for LibusbContext {}

impl LibusbContext {
    /// Initialise a new libusb context
    ///
    /// # Errors
    ///
    /// Returns the libusb status if `libusb_init` fails.
    pub fn new() -> std::result::Result<Self, UsbError> {
        let mut ctx: *mut libusb1_sys::libusb_context = ptr::null_mut();
        // SAFETY: ctx is a valid out-pointer
        let ret = unsafe { libusb1_sys::libusb_init(&mut ctx) };
        if ret < 0 {
            log::error!("Could not create libusb context: {}", UsbError::from(ret).name());
            return Err(UsbError::from(ret));
        }
        log::info!("libusb context initialized");
        Ok(LibusbContext { ctx })
    }

    fn device_list(&self) -> std::result::Result<DeviceList, UsbError> {
        let mut list: *const *mut libusb1_sys::libusb_device = ptr::null();
        // SAFETY: list is a valid out-pointer; freed by DeviceList::drop
        let count = unsafe { libusb1_sys::libusb_get_device_list(self.ctx, &mut list) };
        if count < 0 {
            return Err(UsbError::from(count as i32));
        }
        Ok(DeviceList {
            list,
            len: count as usize,
        })
    }

    /// Attached devices with the given vendor/product id
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the device list cannot be read.
    pub fn list_devices(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError> {
        let list = self.device_list()?;
        let mut found = Vec::new();
        for device in list.iter() {
            let Ok(desc) = device_descriptor(device) else {
                continue;
            };
            if desc.idVendor != vendor_id || desc.idProduct != product_id {
                continue;
            }
            // SAFETY: device stays referenced while the list is alive
            let (bus_number, address) = unsafe {
                (
                    libusb1_sys::libusb_get_bus_number(device),
                    libusb1_sys::libusb_get_device_address(device),
                )
            };
            found.push(UsbDeviceInfo {
                vendor_id,
                product_id,
                bus_number,
                address,
            });
        }
        Ok(found)
    }

    /// Open the first attached device with the given vendor/product id
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotFound`] if no device matches,
    /// [`ScannerError::DeviceOpenFailed`] if `libusb_open` fails.
    pub fn open_device(
        self: &Arc<Self>,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<LibusbDeviceHandle> {
        let list = self.device_list().map_err(ScannerError::Usb)?;
        for device in list.iter() {
            let Ok(desc) = device_descriptor(device) else {
                continue;
            };
            if desc.idVendor != vendor_id || desc.idProduct != product_id {
                continue;
            }

            let mut handle: *mut libusb1_sys::libusb_device_handle = ptr::null_mut();
            // SAFETY: device is valid while the list is alive; libusb_open
            // takes its own reference
            let ret = unsafe { libusb1_sys::libusb_open(device, &mut handle) };
            if ret < 0 || handle.is_null() {
                let err = UsbError::from(ret);
                log::error!("libusb_open failed: {}", err.name());
                return Err(ScannerError::DeviceOpenFailed(format!(
                    "libusb_open: {}",
                    err.name()
                )));
            }
            log::info!(
                "Opened device {:04x}:{:04x}",
                vendor_id,
                product_id
            );
            return Ok(LibusbDeviceHandle {
                handle,
                _context: Arc::clone(self),
            });
        }
        Err(ScannerError::DeviceNotFound)
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                libusb1_sys::libusb_exit(self.ctx);
            }
        }
    }
}

fn device_descriptor(
    device: *mut libusb1_sys::libusb_device,
) -> std::result::Result<libusb1_sys::libusb_device_descriptor, UsbError> {
    // SAFETY: descriptor is plain data, filled by libusb
    unsafe {
        let mut desc = std::mem::zeroed::<libusb1_sys::libusb_device_descriptor>();
        check(libusb1_sys::libusb_get_device_descriptor(device, &mut desc))?;
        Ok(desc)
    }
}

/// Device list owned until drop
struct DeviceList {
    list: *const *mut libusb1_sys::libusb_device,
    len: usize,
}

impl DeviceList {
    fn iter(&self) -> impl Iterator<Item = *mut libusb1_sys::libusb_device> + '_ {
        // SAFETY: libusb guarantees `len` valid entries
        (0..self.len).map(move |i| unsafe { *self.list.add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe {
            if !self.list.is_null() {
                libusb1_sys::libusb_free_device_list(self.list, 1);
            }
        }
    }
}

/// Open scanner; closes the device when dropped
pub struct LibusbDeviceHandle {
    handle: *mut libusb1_sys::libusb_device_handle,
    _context: Arc<LibusbContext>,
}

// SAFETY: libusb device handles are thread-safe for synchronous transfers
unsafe impl Send for LibusbDeviceHandle {}
unsafe impl Sync for LibusbDeviceHandle {}

impl LibusbDeviceHandle {
    fn device(&self) -> *mut libusb1_sys::libusb_device {
        unsafe { libusb1_sys::libusb_get_device(self.handle) }
    }

    /// Select `configuration` unless it is already active
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the configuration cannot be read or set.
    pub fn ensure_configuration(&self, configuration: u8) -> std::result::Result<(), UsbError> {
        let mut current: libc::c_int = 0;
        check(unsafe { libusb1_sys::libusb_get_configuration(self.handle, &mut current) })?;
        if current == libc::c_int::from(configuration) {
            log::debug!("Configuration {} already active", configuration);
            return Ok(());
        }
        log::info!(
            "Switching configuration {} -> {}",
            current,
            configuration
        );
        check(unsafe {
            libusb1_sys::libusb_set_configuration(self.handle, libc::c_int::from(configuration))
        })?;
        Ok(())
    }

    /// Take `interface_number` away from the kernel driver, returning whether
    /// one was bound
    ///
    /// # Errors
    ///
    /// Returns the libusb status if detaching fails.
    pub fn detach_kernel_driver(&self, interface_number: i32) -> std::result::Result<bool, UsbError> {
        unsafe {
            let active = libusb1_sys::libusb_kernel_driver_active(self.handle, interface_number);
            if active == 1 {
                log::info!(
                    "Detaching kernel driver from interface {}",
                    interface_number
                );
                check(libusb1_sys::libusb_detach_kernel_driver(
                    self.handle,
                    interface_number,
                ))?;
                return Ok(true);
            } else if active < 0 {
                // LIBUSB_ERROR_NOT_SUPPORTED on platforms without kernel drivers
                if UsbError::from(active) == UsbError::NotSupported {
                    log::debug!("No kernel driver detach on this platform");
                    return Ok(false);
                }
                log::warn!(
                    "Kernel driver query for interface {} failed: {}",
                    interface_number,
                    UsbError::from(active).name()
                );
            }
            Ok(false)
        }
    }

    /// Give `interface_number` back to the kernel driver
    ///
    /// # Errors
    ///
    /// Returns the libusb status if reattaching fails.
    pub fn attach_kernel_driver(&self, interface_number: i32) -> std::result::Result<(), UsbError> {
        check(unsafe { libusb1_sys::libusb_attach_kernel_driver(self.handle, interface_number) })?;
        log::info!("Kernel driver reattached to interface {}", interface_number);
        Ok(())
    }

    /// Claim `interface_number`, detaching any kernel driver first
    ///
    /// Returns whether a kernel driver was detached. If the claim fails the
    /// driver is reattached before returning.
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the claim fails.
    pub fn claim_interface(&self, interface_number: i32) -> std::result::Result<bool, UsbError> {
        let detached = self.detach_kernel_driver(interface_number).unwrap_or_else(|e| {
            log::warn!(
                "Kernel driver detach on interface {} failed: {}",
                interface_number,
                e.name()
            );
            false
        });
        let ret = unsafe { libusb1_sys::libusb_claim_interface(self.handle, interface_number) };
        let claimed = check(ret).map(|_| ()).map_err(|e| {
            log::error!(
                "Claiming interface {} failed: {}",
                interface_number,
                e.name()
            );
            e
        });
        restore_on_error(detached, claimed, || self.reattach(interface_number))?;
        log::info!("Interface {} claimed", interface_number);
        Ok(detached)
    }

    fn reattach(&self, interface_number: i32) {
        if let Err(e) = self.attach_kernel_driver(interface_number) {
            log::warn!(
                "Kernel driver reattach on interface {} failed: {}",
                interface_number,
                e.name()
            );
        }
    }

    /// Select `alt_setting` on `interface_number`
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the request fails.
    pub fn set_interface_alt_setting(
        &self,
        interface_number: i32,
        alt_setting: i32,
    ) -> std::result::Result<(), UsbError> {
        let ret = unsafe {
            libusb1_sys::libusb_set_interface_alt_setting(
                self.handle,
                interface_number,
                alt_setting,
            )
        };
        if ret < 0 {
            log::error!(
                "Selecting alt setting {}.{} failed: {}",
                interface_number,
                alt_setting,
                UsbError::from(ret).name()
            );
            return Err(UsbError::from(ret));
        }
        log::info!(
            "Interface {} now on alt setting {}",
            interface_number,
            alt_setting
        );
        Ok(())
    }

    /// Scan the active configuration for the bulk endpoint at `address`
    ///
    /// # Errors
    ///
    /// Returns the libusb status if the configuration descriptor is unavailable.
    pub fn find_bulk_endpoint(
        &self,
        address: u8,
    ) -> std::result::Result<Option<EndpointInfo>, UsbError> {
        unsafe {
            let device = self.device();
            let mut cfg_desc: *const libusb1_sys::libusb_config_descriptor = ptr::null();
            let ret = libusb1_sys::libusb_get_active_config_descriptor(device, &mut cfg_desc);
            if ret < 0 {
                log::error!("Active config descriptor unavailable: {}", UsbError::from(ret).name());
                return Err(UsbError::from(ret));
            }

            let cfg = &*cfg_desc;
            log::debug!(
                "Configuration {} has {} interfaces",
                cfg.bConfigurationValue,
                cfg.bNumInterfaces
            );

            let mut found: Option<EndpointInfo> = None;
            'scan: for i in 0..cfg.bNumInterfaces as usize {
                let iface = &*cfg.interface.add(i);
                for j in 0..iface.num_altsetting as usize {
                    let alt = &*iface.altsetting.add(j);
                    for k in 0..alt.bNumEndpoints as usize {
                        let ep = &*alt.endpoint.add(k);
                        log::trace!(
                            "Interface {}.{} endpoint 0x{:02x} {:?} maxPacket={}",
                            alt.bInterfaceNumber,
                            alt.bAlternateSetting,
                            ep.bEndpointAddress,
                            TransferType::from_attributes(ep.bmAttributes),
                            ep.wMaxPacketSize & 0x7FF
                        );
                        if is_bulk_endpoint(ep.bEndpointAddress, ep.bmAttributes, address) {
                            found = Some(EndpointInfo {
                                address: ep.bEndpointAddress,
                                max_packet_size: ep.wMaxPacketSize & 0x7FF,
                                interface_number: alt.bInterfaceNumber,
                                alt_setting: alt.bAlternateSetting,
                            });
                            break 'scan;
                        }
                    }
                }
            }

            // Frees the descriptor obtained above
            libusb1_sys::libusb_free_config_descriptor(cfg_desc as *mut _);

            Ok(found)
        }
    }
}

impl UsbLink for LibusbDeviceHandle {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError> {
        let ret = unsafe {
            libusb1_sys::libusb_control_transfer(
                self.handle,
                request_type,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len() as u16,
                timeout_ms,
            )
        };
        check(ret).map(|n| n as usize)
    }

    fn bulk_read(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError> {
        let mut received: i32 = 0;
        let ret = unsafe {
            libusb1_sys::libusb_bulk_transfer(
                self.handle,
                endpoint,
                data.as_mut_ptr(),
                data.len() as i32,
                &mut received,
                timeout_ms,
            )
        };
        check(ret)?;
        Ok(received.max(0) as usize)
    }

    fn device_ids(&self) -> std::result::Result<(u16, u16), UsbError> {
        let desc = device_descriptor(self.device())?;
        Ok((desc.idVendor, desc.idProduct))
    }

    fn release_interface(&self, interface_number: u8) -> std::result::Result<(), UsbError> {
        let ret = unsafe {
            libusb1_sys::libusb_release_interface(self.handle, i32::from(interface_number))
        };
        check(ret).map(|_| ())
    }
}

impl Drop for LibusbDeviceHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.handle.is_null() {
                libusb1_sys::libusb_close(self.handle);
            }
        }
        log::debug!("Device handle closed");
    }
}

/// [`UsbBackend`] over the system libusb
#[derive(Default)]
pub struct LibusbBackend {
    context: Option<Arc<LibusbContext>>,
}

impl LibusbBackend {
    /// Backend with no context yet; [`UsbBackend::initialize`] creates it
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&mut self) -> std::result::Result<Arc<LibusbContext>, UsbError> {
        self.initialize()?;
        self.context.clone().ok_or(UsbError::Other)
    }
}

impl UsbBackend for LibusbBackend {
    type Link = LibusbDeviceHandle;

    fn initialize(&mut self) -> std::result::Result<(), UsbError> {
        if self.context.is_none() {
            self.context = Some(Arc::new(LibusbContext::new()?));
        }
        Ok(())
    }

    fn list_devices(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError> {
        self.context()?.list_devices(vendor_id, product_id)
    }

    fn open(&mut self, config: &UsbConfig) -> Result<Self::Link> {
        let context = self.context().map_err(ScannerError::Usb)?;
        let handle = context.open_device(config.vendor_id, config.product_id)?;

        // `handle` closes the device on every early return below
        let open_failed =
            |what: &str, e: UsbError| ScannerError::DeviceOpenFailed(format!("{what}: {}", e.name()));

        handle
            .ensure_configuration(config.configuration)
            .map_err(|e| open_failed("set configuration", e))?;

        let endpoint = handle
            .find_bulk_endpoint(config.bulk_endpoint)
            .map_err(|e| open_failed("read config descriptor", e))?
            .ok_or_else(|| {
                ScannerError::DeviceOpenFailed(format!(
                    "bulk endpoint 0x{:02x} not found",
                    config.bulk_endpoint
                ))
            })?;
        log::info!(
            "Found bulk endpoint 0x{:02x} on interface {}.{} (maxPacket={})",
            endpoint.address,
            endpoint.interface_number,
            endpoint.alt_setting,
            endpoint.max_packet_size
        );

        let interface = i32::from(endpoint.interface_number);
        let detached = handle
            .claim_interface(interface)
            .map_err(|e| open_failed("claim interface", e))?;
        if endpoint.alt_setting > 0 {
            let selected =
                handle.set_interface_alt_setting(interface, i32::from(endpoint.alt_setting));
            restore_on_error(detached, selected, || {
                if let Err(e) = handle.release_interface(endpoint.interface_number) {
                    log::debug!("Release of interface {} failed: {}", interface, e.name());
                }
                handle.reattach(interface);
            })
            .map_err(|e| open_failed("set alt setting", e))?;
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_type_from_attributes() {
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x05), TransferType::Isochronous);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
        assert_eq!(TransferType::from_attributes(0x00), TransferType::Control);
    }

    #[test]
    fn test_restore_on_error_reattaches_only_detached_failures() {
        let mut calls = 0;
        let ok: std::result::Result<u8, UsbError> = Ok(1);
        assert_eq!(restore_on_error(true, ok, || calls += 1), Ok(1));
        assert_eq!(calls, 0);

        let failed: std::result::Result<u8, UsbError> = Err(UsbError::Busy);
        assert_eq!(restore_on_error(false, failed, || calls += 1), Err(UsbError::Busy));
        assert_eq!(calls, 0);

        let failed: std::result::Result<u8, UsbError> = Err(UsbError::Busy);
        assert_eq!(restore_on_error(true, failed, || calls += 1), Err(UsbError::Busy));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_is_bulk_endpoint() {
        assert!(is_bulk_endpoint(0x83, 0x02, 0x83));
        // Reserved address bits are ignored
        assert!(is_bulk_endpoint(0x83 | 0x30, 0x02, 0x83));
        // Wrong direction
        assert!(!is_bulk_endpoint(0x03, 0x02, 0x83));
        // Isochronous endpoint at the right address
        assert!(!is_bulk_endpoint(0x83, 0x05, 0x83));
        assert!(!is_bulk_endpoint(0x81, 0x02, 0x83));
    }
}
