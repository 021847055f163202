//! Simulated direct USB scanner
//!
//! [`MockUsbBackend`] hands out [`MockUsbLink`]s that share one
//! [`MockDevice`]. The device echoes the last value written to each
//! (selector, unit) pair, records every control request, and serves
//! scripted bulk chunks. With nothing scripted a bulk read times out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::UsbConfig;
use crate::error::{Result, ScannerError, UsbError};
use crate::transport::{UsbBackend, UsbDeviceInfo, UsbLink};

/// Interface the mock reports as claimed
pub const MOCK_STREAMING_INTERFACE: u8 = 1;

/// One recorded control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue` (selector)
    pub value: u16,
    /// `wIndex` (unit)
    pub index: u16,
    /// Bytes sent, or the buffer length requested for IN transfers
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct DeviceState {
    vendor_id: u16,
    product_id: u16,
    present: AtomicBool,
    opens: AtomicUsize,
    live_links: AtomicUsize,
    controls: Mutex<Vec<ControlRecord>>,
    registers: Mutex<HashMap<(u16, u16), Vec<u8>>>,
    failing: Mutex<HashMap<(u16, u16), UsbError>>,
    short_reads: Mutex<HashMap<(u16, u16), usize>>,
    bulk: Mutex<VecDeque<std::result::Result<Vec<u8>, UsbError>>>,
    released: Mutex<Vec<u8>>,
}

/// Test-side handle to the simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<DeviceState>,
}

impl MockDevice {
    fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            state: Arc::new(DeviceState {
                vendor_id,
                product_id,
                present: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
                live_links: AtomicUsize::new(0),
                controls: Mutex::new(Vec::new()),
                registers: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashMap::new()),
                short_reads: Mutex::new(HashMap::new()),
                bulk: Mutex::new(VecDeque::new()),
                released: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach or detach the device
    pub fn set_present(&self, present: bool) {
        self.state.present.store(present, Ordering::SeqCst);
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Links currently alive (opened and not dropped)
    pub fn live_links(&self) -> usize {
        self.state.live_links.load(Ordering::SeqCst)
    }

    /// Every control request so far
    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state.controls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of control requests so far
    pub fn control_count(&self) -> usize {
        self.state.controls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Preload the value returned for (selector, unit)
    pub fn set_register(&self, selector: u16, unit: u16, value: &[u8]) {
        self.state
            .registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((selector, unit), value.to_vec());
    }

    /// Last value written to (selector, unit)
    pub fn register(&self, selector: u16, unit: u16) -> Option<Vec<u8>> {
        self.state
            .registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(selector, unit))
            .cloned()
    }

    /// Make every request to (selector, unit) fail with `error`
    pub fn fail_control(&self, selector: u16, unit: u16, error: UsbError) {
        self.state
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((selector, unit), error);
    }

    /// Make IN requests to (selector, unit) return only `len` bytes
    pub fn short_read(&self, selector: u16, unit: u16, len: usize) {
        self.state
            .short_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((selector, unit), len);
    }

    /// Append bulk chunks to serve in order
    pub fn queue_chunks<I>(&self, chunks: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.state
            .bulk
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(chunks.into_iter().map(Ok));
    }

    /// Append a failing bulk read
    pub fn queue_error(&self, error: UsbError) {
        self.state.bulk.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(error));
    }

    /// Bulk reads still scripted
    pub fn pending_chunks(&self) -> usize {
        self.state.bulk.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Interfaces a release was attempted on, in order
    pub fn released_interfaces(&self) -> Vec<u8> {
        self.state.released.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// [`UsbBackend`] producing links to one [`MockDevice`]
#[derive(Debug)]
pub struct MockUsbBackend {
    device: MockDevice,
    initialized: bool,
}

impl Default for MockUsbBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUsbBackend {
    /// Backend simulating a scanner with the default ids
    pub fn new() -> Self {
        let config = UsbConfig::default();
        Self::with_ids(config.vendor_id, config.product_id)
    }

    /// Backend simulating a device with the given ids
    pub fn with_ids(vendor_id: u16, product_id: u16) -> Self {
        Self {
            device: MockDevice::new(vendor_id, product_id),
            initialized: false,
        }
    }

    /// Test-side handle to the simulated device
    pub fn device(&self) -> MockDevice {
        self.device.clone()
    }

    /// Whether [`UsbBackend::initialize`] has run
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        let state = &self.device.state;
        state.present.load(Ordering::SeqCst)
            && state.vendor_id == vendor_id
            && state.product_id == product_id
    }
}

impl UsbBackend for MockUsbBackend {
    type Link = MockUsbLink;

    fn initialize(&mut self) -> std::result::Result<(), UsbError> {
        self.initialized = true;
        Ok(())
    }

    fn list_devices(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError> {
        if !self.matches(vendor_id, product_id) {
            return Ok(Vec::new());
        }
        Ok(vec![UsbDeviceInfo {
            vendor_id,
            product_id,
            bus_number: 1,
            address: 4,
        }])
    }

    fn open(&mut self, config: &UsbConfig) -> Result<Self::Link> {
        if !self.matches(config.vendor_id, config.product_id) {
            return Err(ScannerError::DeviceNotFound);
        }
        let state = Arc::clone(&self.device.state);
        state.opens.fetch_add(1, Ordering::SeqCst);
        state.live_links.fetch_add(1, Ordering::SeqCst);
        Ok(MockUsbLink { state })
    }
}

/// Link to a [`MockDevice`]
#[derive(Debug)]
pub struct MockUsbLink {
    state: Arc<DeviceState>,
}

impl UsbLink for MockUsbLink {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError> {
        self.state.controls.lock().unwrap_or_else(PoisonError::into_inner).push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });

        if let Some(error) = self.state.failing.lock().unwrap_or_else(PoisonError::into_inner).get(&(value, index)) {
            return Err(*error);
        }

        if request_type & 0x80 != 0 {
            let stored = self
                .state
                .registers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(value, index))
                .cloned()
                .unwrap_or_default();
            data.fill(0);
            let n = stored.len().min(data.len());
            data[..n].copy_from_slice(&stored[..n]);
            let len = self
                .state
                .short_reads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(value, index))
                .copied()
                .unwrap_or(data.len());
            Ok(len.min(data.len()))
        } else {
            self.state
                .registers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((value, index), data.to_vec());
            Ok(data.len())
        }
    }

    fn bulk_read(
        &self,
        _endpoint: u8,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, UsbError> {
        let next = self.state.bulk.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(Ok(chunk)) => {
                let n = chunk.len().min(data.len());
                data[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            Some(Err(error)) => Err(error),
            None => {
                std::thread::sleep(Duration::from_millis(u64::from(timeout_ms.min(2))));
                Err(UsbError::Timeout)
            }
        }
    }

    fn device_ids(&self) -> std::result::Result<(u16, u16), UsbError> {
        Ok((self.state.vendor_id, self.state.product_id))
    }

    fn release_interface(&self, interface_number: u8) -> std::result::Result<(), UsbError> {
        self.state.released.lock().unwrap_or_else(PoisonError::into_inner).push(interface_number);
        if interface_number == MOCK_STREAMING_INTERFACE {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }
}

impl Drop for MockUsbLink {
    fn drop(&mut self) {
        self.state.live_links.fetch_sub(1, Ordering::SeqCst);
    }
}
