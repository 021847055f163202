//! Continuous capture loop for the direct USB variant
//!
//! A single background thread polls the bulk endpoint with short reads,
//! feeds the chunks through a [`PayloadAssembler`] and fans every completed
//! frame out to the frame callback, the latest-frame slot and the frame
//! queue, in that order.
//!
//! # Example
//!
//! ```ignore
//! let shared = Arc::new(StreamShared::default());
//! let mut capture = CaptureLoop::spawn(link, Arc::clone(&shared), CaptureSettings::from(&config))?;
//!
//! // Frames show up in shared.frames
//!
//! capture.stop(); // joins the thread
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::UsbConfig;
use crate::error::{Result, ScannerError, UsbError};
use crate::frame::{CallbackSlot, ErrorCallback, Frame, FrameCallback, FrameQueue, LatestFrame};
use crate::frame_assembler::{PayloadAssembler, ProcessResult};
use crate::transport::UsbLink;

/// Pause after a hard transport error before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// State shared between the driver and its capture thread
#[derive(Debug, Default)]
pub struct StreamShared {
    /// Completed frames in arrival order
    pub frames: FrameQueue<Frame>,
    /// Most recent completed frame
    pub latest: LatestFrame,
    /// Frame callback
    pub frame_callback: CallbackSlot<FrameCallback>,
    /// Error callback
    pub error_callback: CallbackSlot<ErrorCallback>,
    /// Next frame number
    pub frame_counter: AtomicU64,
}

impl StreamShared {
    /// Number the frame, then hand it to the callback, the latest slot and the queue
    pub fn deliver(&self, data: Vec<u8>) -> u64 {
        let number = self.frame_counter.fetch_add(1, Ordering::AcqRel);
        if let Some(callback) = self.frame_callback.get() {
            callback(&data, number);
        }
        self.latest.store(Frame {
            number,
            data: data.clone(),
        });
        self.frames.push(Frame { number, data });
        number
    }

    /// Log and forward a background error to the error callback
    pub fn report(&self, error: &ScannerError) {
        log::error!("{}", error);
        self.error_callback.report(error.code(), &error.to_string());
    }
}

/// Tunables the capture thread needs from [`UsbConfig`]
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Bulk IN endpoint
    pub endpoint: u8,
    /// Bytes per frame
    pub frame_bytes: usize,
    /// Buffer size per bulk read
    pub chunk_size: usize,
    /// Timeout per bulk read
    pub read_timeout_ms: u32,
    /// Read attempts per frame before giving up on it
    pub max_reads_per_frame: u32,
}

impl From<&UsbConfig> for CaptureSettings {
    fn from(config: &UsbConfig) -> Self {
        Self {
            endpoint: config.bulk_endpoint,
            frame_bytes: config.frame_bytes(),
            chunk_size: config.bulk_chunk_size,
            read_timeout_ms: config.bulk_timeout_ms,
            max_reads_per_frame: config.max_reads_per_frame.max(1),
        }
    }
}

/// Handle to a running capture thread
#[derive(Debug)]
pub struct CaptureLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// Start the capture thread
    ///
    /// # Errors
    ///
    /// Returns [`ScannerError::ThreadCreationFailed`] if the thread cannot be spawned.
    pub fn spawn<L: UsbLink>(
        link: Arc<L>,
        shared: Arc<StreamShared>,
        settings: CaptureSettings,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let mut worker = CaptureWorker {
            link,
            shared,
            settings,
            assembler: PayloadAssembler::new(settings.frame_bytes),
            chunk: vec![0u8; settings.chunk_size.max(2)],
            first_frame_logged: false,
        };

        let handle = thread::Builder::new()
            .name("knokke-capture".to_string())
            .spawn(move || worker.run(&flag))
            .map_err(|e| ScannerError::ThreadCreationFailed(e.to_string()))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Whether the thread has been asked to keep running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the thread to stop and wait for it
    ///
    /// Once this returns no further frame callback fires.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureWorker<L> {
    link: Arc<L>,
    shared: Arc<StreamShared>,
    settings: CaptureSettings,
    assembler: PayloadAssembler,
    chunk: Vec<u8>,
    /// One-shot log of the first frame of this session
    first_frame_logged: bool,
}

impl<L: UsbLink> CaptureWorker<L> {
    fn run(&mut self, running: &AtomicBool) {
        log::info!(
            "Capture thread started (endpoint 0x{:02x}, {} bytes/frame)",
            self.settings.endpoint,
            self.settings.frame_bytes
        );
        while running.load(Ordering::Acquire) {
            self.capture_one(running);
        }
        log::info!("Capture thread stopped");
    }

    /// One frame attempt, bounded by `max_reads_per_frame`
    fn capture_one(&mut self, running: &AtomicBool) {
        self.assembler.reset();
        let mut reads = 0;

        while reads < self.settings.max_reads_per_frame && running.load(Ordering::Acquire) {
            reads += 1;

            let n = match self.link.bulk_read(
                self.settings.endpoint,
                &mut self.chunk,
                self.settings.read_timeout_ms,
            ) {
                Ok(0) | Err(UsbError::Timeout) => continue,
                Ok(n) => n,
                Err(e) => {
                    self.shared.report(&ScannerError::Usb(e));
                    thread::sleep(ERROR_BACKOFF);
                    return;
                }
            };

            match self.assembler.process_chunk(&self.chunk[..n]) {
                ProcessResult::Frame(data) => {
                    let number = self.shared.deliver(data);
                    if !self.first_frame_logged {
                        log::info!("First frame received (#{})", number);
                        self.first_frame_logged = true;
                    }
                    return;
                }
                ProcessResult::Incomplete(len) => {
                    log::debug!("Dropped short frame of {} bytes", len);
                    return;
                }
                ProcessResult::Accumulating | ProcessResult::Skipped => {}
            }
        }

        if reads >= self.settings.max_reads_per_frame {
            log::debug!(
                "Abandoning frame after {} reads ({} bytes buffered)",
                reads,
                self.assembler.buffer_len()
            );
        }
    }
}
