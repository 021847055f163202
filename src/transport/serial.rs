//! Serial-bridge channels
//!
//! The legacy scanner sits behind a dual-channel USB-to-serial bridge. Each
//! channel is opened by serial number and gets a dedicated reader thread that
//! pushes every non-empty read onto a FIFO and then announces how many bytes
//! arrived. Consumers pull the FIFO themselves.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::{Result, ScannerError};
use crate::frame::{BytesAvailableCallback, CallbackSlot, FrameQueue};

/// A byte-stream port that can be split into reader and writer halves
pub trait BridgePort: Read + Write + Send {
    /// Second handle to the same port, used by the reader thread
    ///
    /// # Errors
    ///
    /// Returns the OS error if the handle cannot be duplicated.
    fn try_clone_port(&self) -> io::Result<Box<dyn BridgePort>>;
}

impl BridgePort for Box<dyn serialport::SerialPort> {
    fn try_clone_port(&self) -> io::Result<Box<dyn BridgePort>> {
        let clone = self.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }
}

/// Opens a bridge channel by serial number
pub trait PortOpener: Send + Sync {
    /// Open and configure the channel whose USB serial number is `serial`
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotFound`] if no such channel is attached,
    /// [`ScannerError::DeviceOpenFailed`] if it cannot be opened.
    fn open(&self, serial: &str, config: &BridgeConfig) -> Result<Box<dyn BridgePort>>;
}

/// [`PortOpener`] over the system serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl SystemPortOpener {
    /// Device path of the port whose USB serial number is `serial`
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotFound`] if no attached port carries it.
    pub fn resolve(serial: &str) -> Result<String> {
        serialport::available_ports()?
            .into_iter()
            .find(|port| match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    usb.serial_number.as_deref() == Some(serial)
                }
                _ => false,
            })
            .map(|port| port.port_name)
            .ok_or(ScannerError::DeviceNotFound)
    }
}

impl PortOpener for SystemPortOpener {
    fn open(&self, serial: &str, config: &BridgeConfig) -> Result<Box<dyn BridgePort>> {
        let path = Self::resolve(serial)?;
        log::info!("Opening channel {} at {}", serial, path);
        // Driver transfer sizes have no portable equivalent here
        log::debug!(
            "USB transfer sizes IN {} / OUT {} bytes not applied to {}",
            config.usb_in_transfer_size,
            config.usb_out_transfer_size,
            path
        );
        let port = serialport::new(&path, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(config.io_timeout_ms))
            .open()
            .map_err(|e| ScannerError::DeviceOpenFailed(format!("{serial}: {e}")))?;
        Ok(Box::new(port))
    }
}

/// One open bridge channel with its reader thread
pub struct SerialChannel {
    serial: String,
    writer: Mutex<Option<Box<dyn BridgePort>>>,
    chunks: Arc<FrameQueue<Vec<u8>>>,
    on_bytes: Arc<CallbackSlot<BytesAvailableCallback>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("serial", &self.serial)
            .field("queued_chunks", &self.chunks.len())
            .field("running", &self.is_open())
            .finish()
    }
}

impl SerialChannel {
    /// Open `serial` and start its reader thread
    ///
    /// # Errors
    ///
    /// Propagates the opener's error, or [`ScannerError::ThreadCreationFailed`]
    /// if the reader thread cannot be spawned (the port is closed again).
    pub fn open(opener: &dyn PortOpener, serial: &str, config: &BridgeConfig) -> Result<Self> {
        let port = opener.open(serial, config)?;
        let reader_port = port.try_clone_port()?;

        let chunks = Arc::new(FrameQueue::new());
        let on_bytes: Arc<CallbackSlot<BytesAvailableCallback>> = Arc::default();
        let running = Arc::new(AtomicBool::new(true));

        let worker = ReaderWorker {
            port: reader_port,
            chunks: Arc::clone(&chunks),
            on_bytes: Arc::clone(&on_bytes),
            running: Arc::clone(&running),
            buffer_size: config.read_buffer_size.max(1),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
        };
        let reader = thread::Builder::new()
            .name(format!("knokke-serial-{serial}"))
            .spawn(move || worker.run())
            .map_err(|e| ScannerError::ThreadCreationFailed(e.to_string()))?;

        log::info!("Channel {} open", serial);
        Ok(Self {
            serial: serial.to_string(),
            writer: Mutex::new(Some(port)),
            chunks,
            on_bytes,
            running,
            reader: Some(reader),
        })
    }

    /// Serial number this channel was opened with
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Whether the reader thread is still running
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register the bytes-available notification, replacing any previous one
    pub fn set_bytes_available_callback<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_bytes.set(Arc::new(callback));
    }

    /// FIFO of received chunks, shared with the reader thread
    pub fn chunk_queue(&self) -> Arc<FrameQueue<Vec<u8>>> {
        Arc::clone(&self.chunks)
    }

    /// Pop the oldest received chunk
    pub fn pop_chunk(&self) -> Option<Vec<u8>> {
        self.chunks.try_pop()
    }

    /// Number of chunks waiting to be pulled
    pub fn queued_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Write all of `data` to the channel
    ///
    /// # Errors
    ///
    /// [`ScannerError::DeviceNotConnected`] after [`SerialChannel::close`],
    /// otherwise the I/O error from the port.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let port = writer.as_mut().ok_or(ScannerError::DeviceNotConnected)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    /// Stop and join the reader thread, close the port and drop queued data
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::error!("Reader thread for {} panicked", self.serial);
            }
        }
        let port = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if port.is_some() {
            log::info!("Channel {} closed", self.serial);
        }
        drop(port);
        self.chunks.clear();
        self.on_bytes.clear();
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct ReaderWorker {
    port: Box<dyn BridgePort>,
    chunks: Arc<FrameQueue<Vec<u8>>>,
    on_bytes: Arc<CallbackSlot<BytesAvailableCallback>>,
    running: Arc<AtomicBool>,
    buffer_size: usize,
    idle_sleep: Duration,
}

/// Tracks whether reads are currently failing, so a persistent error is
/// logged once rather than on every retry
#[derive(Debug, Default)]
struct ReadHealth {
    failing: bool,
}

impl ReadHealth {
    /// Record a failed read; true on the first failure of a run
    fn failed(&mut self) -> bool {
        !std::mem::replace(&mut self.failing, true)
    }

    /// Record a working read; true if it ends a run of failures
    fn recovered(&mut self) -> bool {
        std::mem::replace(&mut self.failing, false)
    }
}

impl ReaderWorker {
    fn run(mut self) {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut health = ReadHealth::default();
        while self.running.load(Ordering::Acquire) {
            match self.port.read(&mut buffer) {
                Ok(0) => thread::sleep(self.idle_sleep),
                Ok(n) => {
                    if health.recovered() {
                        log::info!("Serial reads recovered");
                    }
                    log::trace!("Read {} bytes", n);
                    self.chunks.push(buffer[..n].to_vec());
                    if let Some(callback) = self.on_bytes.get() {
                        callback(n);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if health.failed() {
                        log::error!("Serial read failed: {}", e);
                    } else {
                        log::trace!("Serial read still failing: {}", e);
                    }
                    thread::sleep(self.idle_sleep);
                }
            }
        }
        log::debug!("Reader thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPort, MockPortOpener};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_reader_queues_chunks_and_notifies() {
        let port = MockPort::new();
        let opener = MockPortOpener::new().with_port("SE1A", port.clone());
        let channel = SerialChannel::open(&opener, "SE1A", &BridgeConfig::default()).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        channel.set_bytes_available_callback(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });

        port.feed(&[1, 2, 3]);
        port.feed(&[4, 5]);
        assert!(wait_until(|| notified.load(Ordering::SeqCst) == 5));
        assert_eq!(channel.pop_chunk(), Some(vec![1, 2, 3]));
        assert_eq!(channel.pop_chunk(), Some(vec![4, 5]));
        assert_eq!(channel.pop_chunk(), None);
    }

    #[test]
    fn test_write_reaches_port() {
        let port = MockPort::new();
        let opener = MockPortOpener::new().with_port("SE1B", port.clone());
        let channel = SerialChannel::open(&opener, "SE1B", &BridgeConfig::default()).unwrap();
        assert_eq!(channel.write(&[0xAA, 0x55]).unwrap(), 2);
        assert_eq!(port.written(), vec![0xAA, 0x55]);
    }

    #[test]
    fn test_close_releases_port_and_drains_queue() {
        let port = MockPort::new();
        let opener = MockPortOpener::new().with_port("SE1A", port.clone());
        let mut channel =
            SerialChannel::open(&opener, "SE1A", &BridgeConfig::default()).unwrap();
        assert_eq!(port.open_handles(), 2);

        port.feed(&[9; 16]);
        assert!(wait_until(|| channel.queued_chunks() == 1));

        channel.close();
        assert!(!channel.is_open());
        assert_eq!(channel.queued_chunks(), 0);
        assert_eq!(port.open_handles(), 0);
        assert!(matches!(
            channel.write(&[1]),
            Err(ScannerError::DeviceNotConnected)
        ));
    }

    #[test]
    fn test_read_failures_reported_once_per_run() {
        let mut health = ReadHealth::default();
        assert!(health.failed());
        assert!(!health.failed());
        assert!(!health.failed());
        assert!(health.recovered());
        assert!(!health.recovered());
        assert!(health.failed());
    }

    #[test]
    fn test_open_unknown_serial() {
        let opener = MockPortOpener::new();
        assert!(matches!(
            SerialChannel::open(&opener, "SE9A", &BridgeConfig::default()),
            Err(ScannerError::DeviceNotFound)
        ));
    }
}
