//! Direct USB scanner driver
//!
//! [`Scanner`] owns the USB link, runs the probe/commit negotiation, exposes
//! the parameter controls and drives either the continuous [`CaptureLoop`]
//! or one-shot captures.
//!
//! # Example
//!
//! ```ignore
//! let mut scanner = Scanner::with_libusb(UsbConfig::from_env());
//! scanner.connect()?;
//! scanner.set_exposure_time(1_500)?;
//! scanner.set_frame_callback(|data, number| log::info!("frame {} ({} bytes)", number, data.len()));
//! scanner.start_streaming()?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{CaptureLoop, CaptureSettings, StreamShared};
use crate::config::UsbConfig;
use crate::error::{ErrorCode, Result, ScannerError, UsbError};
use crate::frame::Frame;
use crate::frame_assembler::{PayloadAssembler, ProcessResult};
use crate::params::{
    decode_exposure, decode_gain, decode_motor_speed, BacklightChannel, BacklightParameters,
    Control, Direction, ScannerParameters,
};
use crate::transport::libusb::LibusbBackend;
use crate::transport::{UsbBackend, UsbLink};

/// Default deadline for [`Scanner::capture_frame`]
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Byte written to the update control to reboot into the bootloader
const BOOTLOADER_REQUEST: u8 = 0x01;

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No device open
    Disconnected,
    /// Device open and claimed, not streaming
    Connected,
    /// Capture thread running
    Streaming,
}

/// Driver for the direct USB scanner
pub struct Scanner<B: UsbBackend> {
    backend: B,
    config: UsbConfig,
    link: Option<Arc<B::Link>>,
    capture: Option<CaptureLoop>,
    shared: Arc<StreamShared>,
}

impl<B: UsbBackend> std::fmt::Debug for Scanner<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("state", &self.state())
            .field("queued_frames", &self.shared.frames.len())
            .finish()
    }
}

impl Scanner<LibusbBackend> {
    /// Driver over the system libusb
    pub fn with_libusb(config: UsbConfig) -> Self {
        Self::new(LibusbBackend::new(), config)
    }
}

impl<B: UsbBackend> Scanner<B> {
    /// Create a disconnected driver
    pub fn new(backend: B, config: UsbConfig) -> Self {
        Self {
            backend,
            config,
            link: None,
            capture: None,
            shared: Arc::new(StreamShared::default()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    /// Backend the driver opens devices through
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Set up the USB library context; repeated calls are no-ops
    ///
    /// # Errors
    ///
    /// Returns [`ScannerError::Usb`] if the context cannot be created.
    pub fn initialize(&mut self) -> Result<()> {
        self.backend.initialize().map_err(|e| {
            let error = ScannerError::Usb(e);
            self.shared.report(&error);
            error
        })
    }

    /// Open and claim the scanner
    ///
    /// Succeeds without touching the device when already connected.
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotFound`] if no matching device is attached,
    /// [`ScannerError::DeviceOpenFailed`] if it cannot be opened or claimed.
    /// Failures also reach the error callback. On failure nothing stays open.
    pub fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        self.initialize()?;

        log::info!(
            "Connecting to {:04x}:{:04x}",
            self.config.vendor_id,
            self.config.product_id
        );
        let link = self
            .backend
            .open(&self.config)
            .map_err(|e| self.fail(e))?;
        self.link = Some(Arc::new(link));
        log::info!("Scanner connected");
        Ok(())
    }

    /// Stop streaming, release interfaces and close the device
    pub fn disconnect(&mut self) {
        self.stop_streaming();
        let Some(link) = self.link.take() else {
            return;
        };
        for interface in 0..self.config.release_interfaces {
            match link.release_interface(interface) {
                Ok(()) => log::debug!("Released interface {}", interface),
                Err(e) => log::trace!("Release of interface {} skipped: {}", interface, e.name()),
            }
        }
        drop(link);
        log::info!("Scanner disconnected");
    }

    /// Whether a device is open
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Whether the capture thread is running
    pub fn is_streaming(&self) -> bool {
        self.capture.is_some()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        match (&self.link, &self.capture) {
            (None, _) => ConnectionState::Disconnected,
            (Some(_), None) => ConnectionState::Connected,
            (Some(_), Some(_)) => ConnectionState::Streaming,
        }
    }

    /// Identity string of the connected device
    pub fn device_info(&self) -> String {
        let Some(link) = &self.link else {
            return ErrorCode::DeviceNotConnected.message().to_string();
        };
        let (vendor_id, product_id) = link
            .device_ids()
            .unwrap_or((self.config.vendor_id, self.config.product_id));
        format!("Knokke Film Scanner (VID: 0x{vendor_id:04X}, PID: 0x{product_id:04X})")
    }

    // ========================================================================
    // Control transfers
    // ========================================================================

    fn link(&self) -> Result<&Arc<B::Link>> {
        self.link.as_ref().ok_or(ScannerError::DeviceNotConnected)
    }

    fn transfer(&self, control: Control, direction: Direction, data: &mut [u8]) -> Result<usize> {
        let link = self.link()?;
        link.control_transfer(
            direction.request_type(),
            direction.request(),
            control.selector(),
            control.unit(),
            data,
            self.config.control_timeout_ms,
        )
        .map_err(|e| self.fail(ScannerError::ControlTransferFailed(e)))
    }

    fn fail(&self, error: ScannerError) -> ScannerError {
        self.shared.report(&error);
        error
    }

    fn read_control(&self, control: Control) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; control.width()];
        let n = self.transfer(control, Direction::In, &mut buf)?;
        if n < buf.len() {
            log::warn!(
                "{:?} returned {} of {} bytes",
                control,
                n,
                buf.len()
            );
            return Err(self.fail(ScannerError::ControlTransferFailed(UsbError::IoError)));
        }
        Ok(buf)
    }

    fn write_control(&self, control: Control, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.transfer(control, Direction::Out, &mut buf)?;
        log::trace!("{:?} <- {:02x?}", control, data);
        Ok(())
    }

    fn decode<T>(&self, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| self.fail(ScannerError::ControlTransferFailed(UsbError::IoError)))
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Exposure time in microseconds
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] before [`Scanner::connect`],
    /// [`ScannerError::ControlTransferFailed`] if the request fails.
    pub fn get_exposure_time(&self) -> Result<u32> {
        let buf = self.read_control(Control::ExposureTime)?;
        self.decode(decode_exposure(&buf))
    }

    /// Set the exposure time in microseconds
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn set_exposure_time(&self, microseconds: u32) -> Result<()> {
        self.write_control(Control::ExposureTime, &microseconds.to_le_bytes())
    }

    /// Gain in dB x 100
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn get_gain(&self) -> Result<u16> {
        let buf = self.read_control(Control::Gain)?;
        self.decode(decode_gain(&buf))
    }

    /// Set the gain in dB x 100
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn set_gain(&self, gain: u16) -> Result<()> {
        self.write_control(Control::Gain, &gain.to_le_bytes())
    }

    /// All three backlight channels
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn get_backlight(&self) -> Result<BacklightParameters> {
        let buf = self.read_control(Control::Backlight)?;
        self.decode(BacklightParameters::from_bytes(&buf))
    }

    /// Set all three backlight channels in one request
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn set_backlight(&self, backlight: &BacklightParameters) -> Result<()> {
        self.write_control(Control::Backlight, &backlight.to_bytes())
    }

    /// Change one backlight channel
    ///
    /// Reads the current group from the device, replaces one channel and
    /// writes the group back. Not atomic against other writers.
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`]. Nothing is written if the read fails.
    pub fn set_backlight_channel(&self, channel: BacklightChannel, value: u16) -> Result<()> {
        let current = self.get_backlight()?;
        self.set_backlight(&current.with_channel(channel, value))
    }

    /// Motor speed in steps/s x 1000
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn get_motor_speed(&self) -> Result<i32> {
        let buf = self.read_control(Control::MotorSpeed)?;
        self.decode(decode_motor_speed(&buf))
    }

    /// Set the motor speed in steps/s x 1000
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn set_motor_speed(&self, speed: i32) -> Result<()> {
        self.write_control(Control::MotorSpeed, &speed.to_le_bytes())
    }

    /// Read every parameter, stopping at the first failure
    ///
    /// # Errors
    ///
    /// The first error encountered.
    pub fn get_all_parameters(&self) -> Result<ScannerParameters> {
        Ok(ScannerParameters {
            exposure_time_us: self.get_exposure_time()?,
            gain: self.get_gain()?,
            backlight: self.get_backlight()?,
            motor_speed: self.get_motor_speed()?,
        })
    }

    /// Write every parameter in the order exposure, gain, backlight, motor
    ///
    /// Stops at the first failure. Writes that already succeeded stay in
    /// effect.
    ///
    /// # Errors
    ///
    /// The first error encountered.
    pub fn set_all_parameters(&self, params: &ScannerParameters) -> Result<()> {
        self.set_exposure_time(params.exposure_time_us)?;
        self.set_gain(params.gain)?;
        self.set_backlight(&params.backlight)?;
        self.set_motor_speed(params.motor_speed)
    }

    /// Reboot the scanner into its firmware-update bootloader
    ///
    /// The device drops off the bus afterwards; disconnect and rescan.
    ///
    /// # Errors
    ///
    /// See [`Scanner::get_exposure_time`].
    pub fn enter_bootloader(&self) -> Result<()> {
        log::warn!("Requesting bootloader mode");
        self.write_control(Control::Update, &[BOOTLOADER_REQUEST])
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Negotiate the stream format and start the capture thread
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`], [`ScannerError::StreamingAlreadyStarted`],
    /// [`ScannerError::ControlTransferFailed`] if probe or commit fails (the
    /// driver stays connected), or [`ScannerError::ThreadCreationFailed`].
    pub fn start_streaming(&mut self) -> Result<()> {
        let link = Arc::clone(self.link()?);
        if self.capture.is_some() {
            return Err(ScannerError::StreamingAlreadyStarted);
        }

        let probe = self.config.probe_control();
        log::info!(
            "Negotiating stream: format {} frame {} interval {} max frame {} max payload {}",
            probe.format_index,
            probe.frame_index,
            probe.frame_interval,
            probe.max_video_frame_size,
            probe.max_payload_transfer_size
        );
        let block = probe.encode();
        self.write_control(Control::Probe, &block)?;
        self.write_control(Control::Commit, &block)?;

        let capture = CaptureLoop::spawn(
            link,
            Arc::clone(&self.shared),
            CaptureSettings::from(&self.config),
        )
        .map_err(|e| self.fail(e))?;
        self.capture = Some(capture);
        log::info!("Streaming started");
        Ok(())
    }

    /// Stop the capture thread and wait for it to exit
    ///
    /// No frame callback fires after this returns. Does nothing when not
    /// streaming.
    pub fn stop_streaming(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            log::info!("Streaming stopped");
        }
    }

    /// Register the frame callback, replacing any previous one
    ///
    /// Runs on the capture thread.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8], u64) + Send + Sync + 'static,
    {
        self.shared.frame_callback.set(Arc::new(callback));
    }

    /// Register the error callback, replacing any previous one
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(ErrorCode, &str) + Send + Sync + 'static,
    {
        self.shared.error_callback.set(Arc::new(callback));
    }

    /// Most recent streamed frame, left in place
    pub fn get_latest_frame(&self) -> Option<Frame> {
        self.shared.latest.get()
    }

    /// Copy the most recent streamed frame into `buffer`, returning its number
    ///
    /// # Errors
    ///
    /// [`ScannerError::InvalidParameter`] if `buffer` is smaller than a frame,
    /// [`ScannerError::StreamingNotStarted`] if no frame has arrived yet.
    pub fn copy_latest_frame(&self, buffer: &mut [u8]) -> Result<u64> {
        self.check_buffer(buffer)?;
        let frame = self
            .shared
            .latest
            .get()
            .ok_or(ScannerError::StreamingNotStarted)?;
        buffer[..frame.data.len()].copy_from_slice(&frame.data);
        Ok(frame.number)
    }

    /// Pop the oldest queued frame without blocking
    pub fn next_frame(&self) -> Option<Frame> {
        self.shared.frames.try_pop()
    }

    /// Frames waiting in the queue
    pub fn frame_queue_size(&self) -> usize {
        self.shared.frames.len()
    }

    /// Pop the oldest queued frame, waiting up to `timeout`
    ///
    /// # Errors
    ///
    /// [`ScannerError::StreamingNotStarted`] if nothing is queued and the
    /// capture thread is not running.
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        if self.capture.is_none() && self.shared.frames.is_empty() {
            return Err(ScannerError::StreamingNotStarted);
        }
        Ok(self.shared.frames.pop_timeout(timeout))
    }

    // ========================================================================
    // One-shot capture
    // ========================================================================

    fn check_buffer(&self, buffer: &[u8]) -> Result<()> {
        let needed = self.config.frame_bytes();
        if buffer.len() < needed {
            return Err(ScannerError::InvalidParameter(format!(
                "frame buffer holds {} bytes, need {}",
                buffer.len(),
                needed
            )));
        }
        Ok(())
    }

    /// Read one complete frame directly from the bulk endpoint
    ///
    /// Frames closed short by an end-of-frame marker are discarded and
    /// accumulation restarts, until `timeout` runs out.
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`],
    /// [`ScannerError::StreamingAlreadyStarted`] while the capture thread owns
    /// the endpoint, [`ScannerError::Usb`] with [`UsbError::Timeout`] when the
    /// deadline passes, or [`ScannerError::Usb`] for any other bulk failure.
    pub fn capture_frame(&self, timeout: Duration) -> Result<Vec<u8>> {
        let link = self.link()?;
        if self.capture.is_some() {
            return Err(ScannerError::StreamingAlreadyStarted);
        }

        let deadline = Instant::now() + timeout;
        let mut assembler = PayloadAssembler::new(self.config.frame_bytes());
        let mut chunk = vec![0u8; self.config.bulk_chunk_size.max(2)];

        loop {
            if Instant::now() > deadline {
                log::warn!(
                    "Capture timed out with {} of {} bytes",
                    assembler.buffer_len(),
                    assembler.frame_size()
                );
                return Err(ScannerError::Usb(UsbError::Timeout));
            }

            let n = match link.bulk_read(
                self.config.bulk_endpoint,
                &mut chunk,
                self.config.bulk_timeout_ms,
            ) {
                Ok(0) | Err(UsbError::Timeout) => continue,
                Ok(n) => n,
                Err(e) => return Err(self.fail(ScannerError::Usb(e))),
            };

            match assembler.process_chunk(&chunk[..n]) {
                ProcessResult::Frame(data) => return Ok(data),
                ProcessResult::Incomplete(len) => {
                    log::debug!("Discarded short frame of {} bytes, retrying", len);
                }
                ProcessResult::Accumulating | ProcessResult::Skipped => {}
            }
        }
    }

    /// [`Scanner::capture_frame`] into a caller-supplied buffer
    ///
    /// # Errors
    ///
    /// [`ScannerError::InvalidParameter`] if `buffer` is smaller than a frame,
    /// otherwise as [`Scanner::capture_frame`].
    pub fn capture_frame_into(&self, buffer: &mut [u8], timeout: Duration) -> Result<()> {
        self.link()?;
        self.check_buffer(buffer)?;
        let frame = self.capture_frame(timeout)?;
        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(())
    }

    /// Capture `count` frames one after another, handing each to `on_frame`
    /// with its index
    ///
    /// # Errors
    ///
    /// The first capture failure; frames already delivered stay delivered.
    pub fn capture_frames<F>(&self, count: usize, mut on_frame: F) -> Result<()>
    where
        F: FnMut(&[u8], usize),
    {
        self.link()?;
        for index in 0..count {
            let frame = self.capture_frame(DEFAULT_CAPTURE_TIMEOUT)?;
            on_frame(&frame, index);
        }
        Ok(())
    }
}

impl<B: UsbBackend> Drop for Scanner<B> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
