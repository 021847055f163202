//! Simulated serial-bridge channels
//!
//! A [`MockPort`] is the test's end of a channel: bytes fed into it come out
//! of the driver's reads, and bytes the driver writes can be inspected.
//! [`MockPortOpener`] maps serial numbers to ports.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::{Result, ScannerError};
use crate::transport::serial::{BridgePort, PortOpener};

#[derive(Debug, Default)]
struct PortState {
    incoming: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    handles: AtomicUsize,
}

/// Test-side end of a simulated channel
#[derive(Debug, Clone, Default)]
pub struct MockPort {
    state: Arc<PortState>,
}

impl MockPort {
    /// Port with nothing queued
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the driver to read, delivered as one read
    pub fn feed(&self, data: &[u8]) {
        self.state.incoming.lock().unwrap_or_else(PoisonError::into_inner).push_back(data.to_vec());
    }

    /// Everything the driver wrote so far
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Driver-side handles currently open
    pub fn open_handles(&self) -> usize {
        self.state.handles.load(Ordering::SeqCst)
    }

    fn handle(&self) -> MockPortHandle {
        self.state.handles.fetch_add(1, Ordering::SeqCst);
        MockPortHandle {
            state: Arc::clone(&self.state),
        }
    }
}

/// Driver-side handle to a [`MockPort`]
#[derive(Debug)]
pub struct MockPortHandle {
    state: Arc<PortState>,
}

impl Read for MockPortHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = self.state.incoming.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    let rest = chunk.split_off(n);
                    self.state.incoming.lock().unwrap_or_else(PoisonError::into_inner).push_front(rest);
                }
                Ok(n)
            }
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            }
        }
    }
}

impl Write for MockPortHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.written.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BridgePort for MockPortHandle {
    fn try_clone_port(&self) -> io::Result<Box<dyn BridgePort>> {
        self.state.handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPortHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for MockPortHandle {
    fn drop(&mut self) {
        self.state.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`PortOpener`] over a fixed set of [`MockPort`]s
#[derive(Debug, Clone, Default)]
pub struct MockPortOpener {
    ports: Arc<Mutex<HashMap<String, MockPort>>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockPortOpener {
    /// Opener that knows no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `port` under `serial`
    pub fn with_port(self, serial: &str, port: MockPort) -> Self {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner).insert(serial.to_string(), port);
        self
    }

    /// Serial numbers opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PortOpener for MockPortOpener {
    fn open(&self, serial: &str, _config: &BridgeConfig) -> Result<Box<dyn BridgePort>> {
        let port = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
            .ok_or(ScannerError::DeviceNotFound)?;
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).push(serial.to_string());
        Ok(Box::new(port.handle()))
    }
}
