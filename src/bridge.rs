//! Serial-bridge scanner driver
//!
//! The legacy scanner exposes two serial channels on one bridge chip: image
//! data on `<base>A` and raw control traffic on `<base>B`. Data chunks are
//! pulled from the data channel as they arrive and run through a
//! [`DelimiterAssembler`]. Every valid frame goes out twice, as 8-bit bytes
//! and as 16-bit samples, to callbacks first and then to two queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::delimiter::{DelimitedFrame, DelimiterAssembler, ParseState};
use crate::error::{Result, ScannerError};
use crate::frame::{
    convert_8bit_to_16bit, CallbackSlot, Frame, Frame16, Frame16Callback, FrameCallback,
    FrameQueue,
};
use crate::transport::serial::{PortOpener, SerialChannel, SystemPortOpener};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parser, queues, callbacks and counters shared with the data channel's
/// reader thread
#[derive(Debug)]
struct BridgeShared {
    /// Held across parse and delivery so both queues see frames in order
    delivery: Mutex<()>,
    parser: Mutex<DelimiterAssembler>,
    frames: FrameQueue<Frame>,
    frames_16bit: FrameQueue<Frame16>,
    frame_callback: CallbackSlot<FrameCallback>,
    frame_16bit_callback: CallbackSlot<Frame16Callback>,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    error_frames: AtomicU64,
}

impl BridgeShared {
    fn new(frame_size: usize) -> Self {
        Self {
            delivery: Mutex::new(()),
            parser: Mutex::new(DelimiterAssembler::new(frame_size)),
            frames: FrameQueue::new(),
            frames_16bit: FrameQueue::new(),
            frame_callback: CallbackSlot::default(),
            frame_16bit_callback: CallbackSlot::default(),
            total_frames: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            error_frames: AtomicU64::new(0),
        }
    }

    fn process(&self, data: &[u8]) {
        let _order = lock(&self.delivery);
        self.parse_and_deliver(data);
    }

    /// Caller holds `delivery`
    fn parse_and_deliver(&self, data: &[u8]) {
        let completed = lock(&self.parser).process_data(data);
        for frame in completed {
            match frame {
                DelimitedFrame::Valid(data) => self.deliver(data),
                DelimitedFrame::Invalid(len) => {
                    self.error_frames.fetch_add(1, Ordering::AcqRel);
                    log::warn!("Invalid frame of {} bytes discarded", len);
                }
            }
        }
    }

    fn deliver(&self, data: Vec<u8>) {
        let number = self.total_frames.fetch_add(1, Ordering::AcqRel);
        let wide = convert_8bit_to_16bit(&data);

        if let Some(callback) = self.frame_callback.get() {
            callback(&data, number);
        }
        if let Some(callback) = self.frame_16bit_callback.get() {
            callback(&wide, number);
        }

        self.frames.push(Frame { number, data });
        self.frames_16bit.push(Frame16 { number, data: wide });
        log::trace!("Frame #{} queued", number);
    }

    /// Pull every queued data-channel chunk, popping under `delivery` so
    /// chunks are parsed in arrival order
    fn drain(&self, chunks: &FrameQueue<Vec<u8>>) {
        let _order = lock(&self.delivery);
        while let Some(chunk) = chunks.try_pop() {
            self.total_bytes
                .fetch_add(chunk.len() as u64, Ordering::AcqRel);
            self.parse_and_deliver(&chunk);
        }
    }

    fn reset(&self) {
        let _order = lock(&self.delivery);
        lock(&self.parser).reset();
        self.frames.clear();
        self.frames_16bit.clear();
    }
}

/// Driver for the serial-bridge scanner
pub struct BridgeScanner<O: PortOpener = SystemPortOpener> {
    opener: O,
    config: BridgeConfig,
    data: Option<SerialChannel>,
    control: Option<SerialChannel>,
    shared: Arc<BridgeShared>,
}

impl<O: PortOpener> std::fmt::Debug for BridgeScanner<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeScanner")
            .field("data", &self.data)
            .field("control", &self.control)
            .field("queued_frames", &self.shared.frames.len())
            .finish()
    }
}

impl BridgeScanner<SystemPortOpener> {
    /// Driver over the system serial ports
    pub fn with_system_ports(config: BridgeConfig) -> Self {
        Self::new(SystemPortOpener, config)
    }
}

impl<O: PortOpener> BridgeScanner<O> {
    /// Create a closed driver
    pub fn new(opener: O, config: BridgeConfig) -> Self {
        let shared = Arc::new(BridgeShared::new(config.frame_bytes()));
        Self {
            opener,
            config,
            data: None,
            control: None,
            shared,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Payload bytes per frame
    pub fn frame_size(&self) -> usize {
        self.config.frame_bytes()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open both channels of the bridge whose base serial is `base_serial`
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceOpenFailed`] if already open, otherwise the
    /// error from opening either channel. If the control channel fails the
    /// data channel is closed again before returning.
    pub fn open(&mut self, base_serial: &str) -> Result<()> {
        if self.data.is_some() {
            return Err(ScannerError::DeviceOpenFailed(format!(
                "{base_serial}: device already open"
            )));
        }

        let data_serial = self.config.data_serial(base_serial);
        let control_serial = self.config.control_serial(base_serial);
        log::info!(
            "Opening bridge {} (data {}, control {})",
            base_serial,
            data_serial,
            control_serial
        );

        let mut data = SerialChannel::open(&self.opener, &data_serial, &self.config)?;
        let control = match SerialChannel::open(&self.opener, &control_serial, &self.config) {
            Ok(control) => control,
            Err(e) => {
                log::error!("Control channel {} failed: {}", control_serial, e);
                data.close();
                return Err(e);
            }
        };

        let chunks = data.chunk_queue();
        let shared = Arc::clone(&self.shared);
        data.set_bytes_available_callback(move |_added| shared.drain(&chunks));
        // Anything that arrived before the callback was registered
        self.shared.drain(&data.chunk_queue());

        self.data = Some(data);
        self.control = Some(control);
        log::info!("Bridge {} open", base_serial);
        Ok(())
    }

    /// Close both channels, reset the parser and drop queued frames
    ///
    /// Statistics are kept; see [`BridgeScanner::reset_statistics`].
    pub fn close(&mut self) {
        if self.data.is_none() && self.control.is_none() {
            return;
        }
        if let Some(mut data) = self.data.take() {
            data.close();
        }
        if let Some(mut control) = self.control.take() {
            control.close();
        }
        self.shared.reset();
        log::info!("Bridge closed");
    }

    /// Whether both channels are open
    pub fn is_open(&self) -> bool {
        self.data.is_some()
    }

    // ========================================================================
    // Control channel
    // ========================================================================

    /// The raw control channel while open
    pub fn control_channel(&self) -> Option<&SerialChannel> {
        self.control.as_ref()
    }

    fn require_control(&self) -> Result<&SerialChannel> {
        self.control.as_ref().ok_or(ScannerError::DeviceNotConnected)
    }

    /// Write raw bytes to the control channel
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] when closed, otherwise the write error.
    pub fn send_control(&self, data: &[u8]) -> Result<usize> {
        self.require_control()?.write(data)
    }

    /// Oldest chunk received on the control channel
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] when closed.
    pub fn read_control(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.require_control()?.pop_chunk())
    }

    /// Notification for bytes arriving on the control channel
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] when closed.
    pub fn set_control_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.require_control()?.set_bytes_available_callback(callback);
        Ok(())
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Run raw data-channel bytes through the parser
    ///
    /// The reader thread calls this for every received chunk; it is public so
    /// captured streams can be replayed.
    pub fn process_incoming_data(&self, data: &[u8]) {
        self.shared.process(data);
    }

    /// Current parser state
    pub fn parse_state(&self) -> ParseState {
        lock(&self.shared.parser).state()
    }

    /// Register the 8-bit frame callback, replacing any previous one
    ///
    /// Runs on the data channel's reader thread with frame delivery locked;
    /// it must not call [`BridgeScanner::process_incoming_data`].
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8], u64) + Send + Sync + 'static,
    {
        self.shared.frame_callback.set(Arc::new(callback));
    }

    /// Register the 16-bit frame callback, replacing any previous one
    pub fn set_frame_16bit_callback<F>(&self, callback: F)
    where
        F: Fn(&[u16], u64) + Send + Sync + 'static,
    {
        self.shared.frame_16bit_callback.set(Arc::new(callback));
    }

    /// Pop the oldest 8-bit frame without blocking
    pub fn next_frame(&self) -> Option<Frame> {
        self.shared.frames.try_pop()
    }

    /// Pop the oldest 16-bit frame without blocking
    pub fn next_frame_16bit(&self) -> Option<Frame16> {
        self.shared.frames_16bit.try_pop()
    }

    /// 8-bit frames waiting
    pub fn frame_queue_size(&self) -> usize {
        self.shared.frames.len()
    }

    /// 16-bit frames waiting
    pub fn frame_16bit_queue_size(&self) -> usize {
        self.shared.frames_16bit.len()
    }

    /// Pop the oldest 8-bit frame, waiting up to `timeout`
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] if closed and nothing is queued.
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        if self.data.is_none() && self.shared.frames.is_empty() {
            return Err(ScannerError::DeviceNotConnected);
        }
        Ok(self.shared.frames.pop_timeout(timeout))
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Valid frames delivered
    pub fn total_frames_received(&self) -> u64 {
        self.shared.total_frames.load(Ordering::Acquire)
    }

    /// Bytes pulled from the data channel
    pub fn total_bytes_processed(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Acquire)
    }

    /// Frames rejected by validation
    pub fn frames_with_errors(&self) -> u64 {
        self.shared.error_frames.load(Ordering::Acquire)
    }

    /// Zero all counters
    pub fn reset_statistics(&self) {
        self.shared.total_frames.store(0, Ordering::Release);
        self.shared.total_bytes.store(0, Ordering::Release);
        self.shared.error_frames.store(0, Ordering::Release);
    }
}

impl<O: PortOpener> Drop for BridgeScanner<O> {
    fn drop(&mut self) {
        self.close();
    }
}
