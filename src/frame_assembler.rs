//! Frame assembly from bulk payload chunks
//!
//! Each bulk read returns one chunk that starts with a payload header:
//! byte 0 is the header length, byte 1 the bit-field header whose bit 1
//! marks end-of-frame. Payload bytes after the header are appended to the
//! in-progress frame until it is full or the end-of-frame bit is seen.
//!
//! # Usage
//!
//! ```rust,ignore
//! use knokke_scanner::frame_assembler::{PayloadAssembler, ProcessResult};
//!
//! let mut assembler = PayloadAssembler::new(3840 * 12 * 2);
//!
//! for chunk in bulk_chunks {
//!     if let ProcessResult::Frame(frame) = assembler.process_chunk(&chunk) {
//!         process_frame(frame);
//!     }
//! }
//! ```

/// End-of-frame bit in the bit-field header
pub const HEADER_EOF: u8 = 1 << 1;

/// Result of processing a single chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// No complete frame yet, continue accumulating
    Accumulating,
    /// Complete frame ready
    Frame(Vec<u8>),
    /// End-of-frame arrived before the frame was full; the partial frame
    /// (of the given length) was discarded
    Incomplete(usize),
    /// Chunk was malformed and ignored
    Skipped,
}

/// Parsed payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Header length in bytes, payload starts at this offset
    pub length: usize,
    /// End-of-frame flag
    pub end_of_frame: bool,
}

/// Parse the payload header at the start of a chunk
///
/// Returns `None` for chunks shorter than two bytes or whose declared header
/// length runs past the end of the chunk.
pub fn parse_payload_header(chunk: &[u8]) -> Option<PayloadHeader> {
    if chunk.len() < 2 {
        return None;
    }
    let length = chunk[0] as usize;
    if length > chunk.len() {
        return None;
    }
    Some(PayloadHeader {
        length,
        end_of_frame: chunk[1] & HEADER_EOF != 0,
    })
}

/// Assembles fixed-size frames from header-prefixed chunks
#[derive(Debug)]
pub struct PayloadAssembler {
    /// In-progress frame, never longer than `frame_size`
    frame_buffer: Vec<u8>,
    /// Target frame size in bytes
    frame_size: usize,
    /// Payload bytes dropped because the frame was already full
    dropped_bytes: u64,
    /// Chunks ignored because their header was malformed
    skipped_chunks: u64,
}

impl PayloadAssembler {
    /// Create an assembler for frames of `frame_size` bytes
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_buffer: Vec::with_capacity(frame_size),
            frame_size,
            dropped_bytes: 0,
            skipped_chunks: 0,
        }
    }

    /// Abandon the in-progress frame
    pub fn reset(&mut self) {
        self.frame_buffer.clear();
    }

    /// Bytes accumulated for the in-progress frame
    pub fn buffer_len(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Target frame size
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Payload bytes dropped past the end of a full frame
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Malformed chunks ignored so far
    pub fn skipped_chunks(&self) -> u64 {
        self.skipped_chunks
    }

    /// Process one bulk chunk
    ///
    /// Returns `ProcessResult::Frame(data)` as soon as the buffer reaches the
    /// target size, whether or not the end-of-frame bit is set on this chunk.
    /// Excess payload in the completing chunk is dropped, not carried over.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> ProcessResult {
        let Some(header) = parse_payload_header(chunk) else {
            self.skipped_chunks += 1;
            log::trace!("Skipping malformed chunk of {} bytes", chunk.len());
            return ProcessResult::Skipped;
        };

        let payload = &chunk[header.length..];
        let space_left = self.frame_size - self.frame_buffer.len();
        let to_copy = payload.len().min(space_left);
        self.frame_buffer.extend_from_slice(&payload[..to_copy]);
        if payload.len() > to_copy {
            self.dropped_bytes += (payload.len() - to_copy) as u64;
        }

        if self.frame_buffer.len() >= self.frame_size {
            let frame = std::mem::replace(
                &mut self.frame_buffer,
                Vec::with_capacity(self.frame_size),
            );
            return ProcessResult::Frame(frame);
        }

        if header.end_of_frame {
            let partial = self.frame_buffer.len();
            self.frame_buffer.clear();
            log::debug!(
                "End of frame after {} of {} bytes, discarding",
                partial,
                self.frame_size
            );
            return ProcessResult::Incomplete(partial);
        }

        ProcessResult::Accumulating
    }
}
