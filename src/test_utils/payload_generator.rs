//! Synthetic payload generation for testing
//!
//! Builds header-prefixed bulk chunks for the direct USB variant and
//! delimiter envelopes for the serial-bridge variant, from frames with known
//! content so tests can compare byte-for-byte.
//!
//! # Example
//!
//! ```rust,ignore
//! use knokke_scanner::test_utils::{envelope, ramp_frame, PayloadGenerator};
//!
//! let frame = ramp_frame(92_160);
//! let chunks = PayloadGenerator::new(36_864).frame_chunks(&frame);
//!
//! let bytes = envelope(&ramp_frame(46_080));
//! ```

use crate::delimiter::{END_DELIMITER, START_DELIMITER};
use crate::frame_assembler::HEADER_EOF;

/// Payload header builder
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    /// Header length (2 or 12)
    pub length: u8,
    /// Frame ID bit, toggles each frame
    pub fid: bool,
    /// End of frame bit
    pub eof: bool,
}

impl ChunkHeader {
    /// Minimal 2-byte header
    pub fn minimal(fid: bool, eof: bool) -> Self {
        Self {
            length: 2,
            fid,
            eof,
        }
    }

    /// 12-byte header with zeroed timestamp fields
    pub fn full(fid: bool, eof: bool) -> Self {
        Self {
            length: 12,
            fid,
            eof,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.length.max(2) as usize];
        bytes[0] = self.length;

        // EOH always set
        let mut flags = 0x80u8;
        if self.fid {
            flags |= 0x01;
        }
        if self.eof {
            flags |= HEADER_EOF;
        }
        if self.length >= 12 {
            flags |= 0x0C;
        }
        bytes[1] = flags;
        bytes
    }
}

/// Splits frames into header-prefixed bulk chunks
#[derive(Debug)]
pub struct PayloadGenerator {
    /// Maximum payload size per chunk (excluding header)
    pub max_payload_size: usize,
    /// Use 12-byte headers instead of 2-byte ones
    pub full_headers: bool,
    current_fid: bool,
}

impl Default for PayloadGenerator {
    fn default() -> Self {
        Self::new(0x9000)
    }
}

impl PayloadGenerator {
    /// Generator producing chunks of at most `max_payload_size` payload bytes
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
            full_headers: false,
            current_fid: false,
        }
    }

    fn header(&self, eof: bool) -> ChunkHeader {
        if self.full_headers {
            ChunkHeader::full(self.current_fid, eof)
        } else {
            ChunkHeader::minimal(self.current_fid, eof)
        }
    }

    /// Chunks for one frame, end-of-frame set on the last one
    pub fn frame_chunks(&mut self, frame_data: &[u8]) -> Vec<Vec<u8>> {
        self.current_fid = !self.current_fid;

        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < frame_data.len() {
            let payload_size = (frame_data.len() - offset).min(self.max_payload_size);
            let is_last = offset + payload_size >= frame_data.len();

            let mut chunk = self.header(is_last).to_bytes();
            chunk.extend_from_slice(&frame_data[offset..offset + payload_size]);
            chunks.push(chunk);
            offset += payload_size;
        }
        chunks
    }

    /// Chunks for the first `cut` bytes of a frame, closed early with end-of-frame
    pub fn truncated_frame_chunks(&mut self, frame_data: &[u8], cut: usize) -> Vec<Vec<u8>> {
        self.frame_chunks(&frame_data[..cut.min(frame_data.len())])
    }
}

/// Wrap `payload` in the start/end delimiter envelope
pub fn envelope(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(&START_DELIMITER);
    data.extend_from_slice(payload);
    data.extend_from_slice(&END_DELIMITER);
    data
}

/// Frame whose byte at `i` is `i mod 256`
pub fn ramp_frame(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Frame filled with `value`
pub fn solid_frame(len: usize, value: u8) -> Vec<u8> {
    vec![value; len]
}

/// Deterministic pseudo-random frame (xorshift) for content-agnostic checks
pub fn noise_frame(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
