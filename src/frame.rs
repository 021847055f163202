//! Frames, frame queues and callback registration
//!
//! A frame is only ever queued or handed to a callback once it has exactly
//! the expected length. Queues are unbounded FIFOs; a consumer that never
//! drains them makes them grow without limit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

/// A complete frame and its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number assigned at completion, starting at 0
    pub number: u64,
    /// Raw sensor bytes
    pub data: Vec<u8>,
}

/// A complete frame widened to 16 bits per sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame16 {
    /// Same number as the 8-bit frame it was derived from
    pub number: u64,
    /// Samples with the sensor byte in the upper half
    pub data: Vec<u16>,
}

/// Called with each completed 8-bit frame and its number
pub type FrameCallback = dyn Fn(&[u8], u64) + Send + Sync;
/// Called with each completed 16-bit frame and its number
pub type Frame16Callback = dyn Fn(&[u16], u64) + Send + Sync;
/// Called with the error code and a message for background failures
pub type ErrorCallback = dyn Fn(ErrorCode, &str) + Send + Sync;
/// Called with the number of bytes a serial channel just queued
pub type BytesAvailableCallback = dyn Fn(usize) + Send + Sync;

/// Upscale 8-bit samples into the upper byte of 16-bit words
pub fn convert_8bit_to_16bit(data: &[u8]) -> Vec<u16> {
    data.iter().map(|&b| u16::from(b) << 8).collect()
}

/// Keep the upper byte of each 16-bit word
pub fn convert_16bit_to_8bit(data: &[u16]) -> Vec<u8> {
    data.iter().map(|&w| (w >> 8) as u8).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe FIFO with blocking pop
#[derive(Debug)]
pub struct FrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake all waiters
    pub fn push(&self, item: T) {
        lock(&self.items).push_back(item);
        self.available.notify_all();
    }

    /// Pop the oldest item without blocking
    pub fn try_pop(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = lock(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = self
                .available
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Drop every queued item
    pub fn clear(&self) {
        lock(&self.items).clear();
    }
}

/// Registration slot for a user callback
///
/// The callback is cloned out of the slot before it runs, so user code never
/// executes while the slot (or any queue) is locked. Registering replaces any
/// previous callback.
pub struct CallbackSlot<F: ?Sized> {
    inner: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for CallbackSlot<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("registered", &lock(&self.inner).is_some())
            .finish()
    }
}

impl<F: ?Sized> CallbackSlot<F> {
    /// Replace the registered callback
    pub fn set(&self, callback: Arc<F>) {
        *lock(&self.inner) = Some(callback);
    }

    /// Remove the registered callback
    pub fn clear(&self) {
        *lock(&self.inner) = None;
    }

    /// Current callback, if any
    pub fn get(&self) -> Option<Arc<F>> {
        lock(&self.inner).clone()
    }
}

impl CallbackSlot<ErrorCallback> {
    /// Fire the error callback if one is registered
    pub fn report(&self, code: ErrorCode, message: &str) {
        if let Some(callback) = self.get() {
            callback(code, message);
        }
    }
}

/// Single-value slot holding the most recent frame
#[derive(Debug, Default)]
pub struct LatestFrame {
    frame: Mutex<Option<Frame>>,
}

impl LatestFrame {
    /// Replace the stored frame
    pub fn store(&self, frame: Frame) {
        *lock(&self.frame) = Some(frame);
    }

    /// Copy of the stored frame, leaving it in place
    pub fn get(&self) -> Option<Frame> {
        lock(&self.frame).clone()
    }

    /// Forget the stored frame
    pub fn clear(&self) {
        *lock(&self.frame) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_convert_8bit_to_16bit() {
        assert_eq!(
            convert_8bit_to_16bit(&[0x00, 0x01, 0x80, 0xFF]),
            vec![0x0000, 0x0100, 0x8000, 0xFF00]
        );
        assert!(convert_8bit_to_16bit(&[]).is_empty());
    }

    #[test]
    fn test_16bit_round_trip_any_length() {
        let data: Vec<u8> = (0..=255u8).chain([7, 0, 255]).collect();
        assert_eq!(convert_16bit_to_8bit(&convert_8bit_to_16bit(&data)), data);
    }

    #[test]
    fn test_convert_16bit_drops_low_byte() {
        assert_eq!(convert_16bit_to_8bit(&[0x12FF, 0x0001]), vec![0x12, 0x00]);
    }

    #[test]
    fn test_queue_fifo_order() {
        let queue = FrameQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_pop_timeout_expires() {
        let queue: FrameQueue<u8> = FrameQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_queue_pop_timeout_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42u32);
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_queue_clear() {
        let queue = FrameQueue::new();
        queue.push("a");
        queue.push("b");
        queue.clear();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_callback_slot_replaces_previous() {
        let slot: CallbackSlot<FrameCallback> = CallbackSlot::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        slot.set(Arc::new(move |_: &[u8], _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        slot.set(Arc::new(move |_: &[u8], _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        if let Some(cb) = slot.get() {
            cb(&[1, 2, 3], 1);
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        slot.clear();
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_error_slot_report_without_callback() {
        let slot: CallbackSlot<ErrorCallback> = CallbackSlot::default();
        slot.report(ErrorCode::UnknownError, "nobody listening");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.set(Arc::new(move |code: ErrorCode, msg: &str| {
            sink.lock().unwrap().push((code, msg.to_string()));
        }));
        slot.report(ErrorCode::TransportError, "bulk read failed");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ErrorCode::TransportError, "bulk read failed".to_string())]
        );
    }

    #[test]
    fn test_latest_frame_is_not_consumed() {
        let latest = LatestFrame::default();
        assert!(latest.get().is_none());
        latest.store(Frame {
            number: 3,
            data: vec![9; 4],
        });
        assert_eq!(latest.get().map(|f| f.number), Some(3));
        assert_eq!(latest.get().map(|f| f.number), Some(3));
        latest.clear();
        assert!(latest.get().is_none());
    }
}
