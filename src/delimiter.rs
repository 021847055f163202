//! Delimiter-framed reassembly for the serial-bridge data channel
//!
//! The bridge sends each frame as
//!
//! ```text
//! [FF 01 B1 6B][FRAME_SIZE_BYTES payload][FF 01 01 B5]
//! ```
//!
//! The payload window has a fixed length and is copied without scanning, so
//! payload bytes that happen to look like a delimiter are harmless. Parser
//! state survives chunk boundaries; up to three trailing bytes of a scanned
//! chunk are carried into the next one so a delimiter split across two reads
//! is still found.

use std::borrow::Cow;

/// Marks the start of a frame envelope
pub const START_DELIMITER: [u8; 4] = [0xFF, 0x01, 0xB1, 0x6B];
/// Marks the end of a frame envelope
pub const END_DELIMITER: [u8; 4] = [0xFF, 0x01, 0x01, 0xB5];
/// Delimiter length in bytes
pub const DELIMITER_LEN: usize = 4;

/// Where the parser is within the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Scanning for the start delimiter
    AwaitingStart,
    /// Copying the fixed-length payload
    AccumulatingPayload,
    /// Scanning for the end delimiter
    AwaitingEnd,
}

/// A frame closed by an end delimiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelimitedFrame {
    /// Passed validation
    Valid(Vec<u8>),
    /// Failed validation; carries the rejected length
    Invalid(usize),
}

/// Offset of the first occurrence of `delimiter` in `data` at or after `start`
pub fn find_frame_delimiter(data: &[u8], start: usize, delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() {
        return None;
    }
    data.get(start..)?
        .windows(delimiter.len())
        .position(|window| window == delimiter)
        .map(|pos| pos + start)
}

/// Length check applied to every completed frame
pub fn validate_frame(frame: &[u8], frame_size: usize) -> bool {
    if frame.len() != frame_size {
        log::warn!(
            "Frame size mismatch: expected {}, got {}",
            frame_size,
            frame.len()
        );
        return false;
    }
    true
}

/// Delimiter-driven frame parser
#[derive(Debug)]
pub struct DelimiterAssembler {
    state: ParseState,
    frame_size: usize,
    frame_buffer: Vec<u8>,
    /// Unscanned tail of the previous chunk
    carry: Vec<u8>,
}

impl DelimiterAssembler {
    /// Create a parser for payloads of `frame_size` bytes
    pub fn new(frame_size: usize) -> Self {
        Self {
            state: ParseState::AwaitingStart,
            frame_size,
            frame_buffer: Vec::with_capacity(frame_size),
            carry: Vec::with_capacity(DELIMITER_LEN),
        }
    }

    /// Current parser state
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Payload bytes collected for the in-progress frame
    pub fn buffered(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Expected payload size
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Drop all partial state and wait for the next start delimiter
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitingStart;
        self.frame_buffer.clear();
        self.carry.clear();
    }

    /// Feed one chunk, returning every frame closed inside it in order
    pub fn process_data(&mut self, data: &[u8]) -> Vec<DelimitedFrame> {
        let input: Cow<'_, [u8]> = if self.carry.is_empty() {
            Cow::Borrowed(data)
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(data);
            Cow::Owned(joined)
        };
        let data = input.as_ref();

        let mut frames = Vec::new();
        let mut index = 0;
        while index < data.len() {
            match self.state {
                ParseState::AwaitingStart => {
                    match find_frame_delimiter(data, index, &START_DELIMITER) {
                        Some(pos) => {
                            if pos > index {
                                log::trace!("Skipped {} bytes before start delimiter", pos - index);
                            }
                            self.state = ParseState::AccumulatingPayload;
                            self.frame_buffer.clear();
                            index = pos + DELIMITER_LEN;
                        }
                        None => {
                            self.keep_tail(data, index);
                            index = data.len();
                        }
                    }
                }
                ParseState::AccumulatingPayload => {
                    let wanted = self.frame_size - self.frame_buffer.len();
                    let take = wanted.min(data.len() - index);
                    self.frame_buffer
                        .extend_from_slice(&data[index..index + take]);
                    index += take;
                    if self.frame_buffer.len() >= self.frame_size {
                        self.state = ParseState::AwaitingEnd;
                    }
                }
                ParseState::AwaitingEnd => {
                    match find_frame_delimiter(data, index, &END_DELIMITER) {
                        Some(pos) => {
                            let frame = std::mem::replace(
                                &mut self.frame_buffer,
                                Vec::with_capacity(self.frame_size),
                            );
                            if validate_frame(&frame, self.frame_size) {
                                frames.push(DelimitedFrame::Valid(frame));
                            } else {
                                frames.push(DelimitedFrame::Invalid(frame.len()));
                            }
                            self.state = ParseState::AwaitingStart;
                            index = pos + DELIMITER_LEN;
                        }
                        None => {
                            self.keep_tail(data, index);
                            index = data.len();
                        }
                    }
                }
            }
        }

        // A zero-length payload completes without consuming input
        if self.state == ParseState::AccumulatingPayload
            && self.frame_buffer.len() >= self.frame_size
        {
            self.state = ParseState::AwaitingEnd;
        }

        frames
    }

    fn keep_tail(&mut self, data: &[u8], index: usize) {
        let start = data.len().saturating_sub(DELIMITER_LEN - 1).max(index);
        self.carry.clear();
        self.carry.extend_from_slice(&data[start..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: &[u8]) -> Vec<u8> {
        let mut data = START_DELIMITER.to_vec();
        data.extend_from_slice(payload);
        data.extend_from_slice(&END_DELIMITER);
        data
    }

    // ========================================================================
    // Delimiter search
    // ========================================================================

    #[test]
    fn test_find_delimiter() {
        let data = [0x00, 0xFF, 0x01, 0xB1, 0x6B, 0x00];
        assert_eq!(find_frame_delimiter(&data, 0, &START_DELIMITER), Some(1));
        assert_eq!(find_frame_delimiter(&data, 1, &START_DELIMITER), Some(1));
        assert_eq!(find_frame_delimiter(&data, 2, &START_DELIMITER), None);
        assert_eq!(find_frame_delimiter(&data, 0, &END_DELIMITER), None);
    }

    #[test]
    fn test_find_delimiter_edge_cases() {
        assert_eq!(find_frame_delimiter(&[], 0, &START_DELIMITER), None);
        assert_eq!(find_frame_delimiter(&[1, 2, 3], 10, &START_DELIMITER), None);
        assert_eq!(find_frame_delimiter(&[1, 2, 3], 0, &[]), None);
        assert_eq!(find_frame_delimiter(&START_DELIMITER, 0, &START_DELIMITER), Some(0));
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_frame() {
        assert!(!validate_frame(&[], 16));
        assert!(!validate_frame(&[0; 15], 16));
        assert!(!validate_frame(&[0; 17], 16));
        assert!(validate_frame(&[0; 16], 16));
        assert!(validate_frame(&[0xFF; 16], 16));
    }

    // ========================================================================
    // State machine
    // ========================================================================

    #[test]
    fn test_single_envelope() {
        let payload: Vec<u8> = (0..16).collect();
        let mut parser = DelimiterAssembler::new(16);
        let frames = parser.process_data(&envelope(&payload));
        assert_eq!(frames, vec![DelimitedFrame::Valid(payload)]);
        assert_eq!(parser.state(), ParseState::AwaitingStart);
    }

    #[test]
    fn test_payload_containing_delimiters_is_opaque() {
        let mut payload = END_DELIMITER.to_vec();
        payload.extend_from_slice(&START_DELIMITER);
        let mut parser = DelimiterAssembler::new(8);
        let frames = parser.process_data(&envelope(&payload));
        assert_eq!(frames, vec![DelimitedFrame::Valid(payload)]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let payload: Vec<u8> = (0..32).collect();
        let data = envelope(&payload);
        let mut parser = DelimiterAssembler::new(32);

        let mut frames = Vec::new();
        for chunk in data.chunks(5) {
            frames.extend(parser.process_data(chunk));
        }
        assert_eq!(frames, vec![DelimitedFrame::Valid(payload)]);
    }

    #[test]
    fn test_delimiter_split_byte_by_byte() {
        let payload = vec![0xAB; 6];
        let data = envelope(&payload);
        let mut parser = DelimiterAssembler::new(6);

        let mut frames = Vec::new();
        for byte in &data {
            frames.extend(parser.process_data(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![DelimitedFrame::Valid(payload)]);
    }

    #[test]
    fn test_end_delimiter_only() {
        let mut parser = DelimiterAssembler::new(8);
        let frames = parser.process_data(&END_DELIMITER);
        assert!(frames.is_empty());
        assert_eq!(parser.state(), ParseState::AwaitingStart);
    }

    #[test]
    fn test_garbage_between_payload_and_end() {
        let payload = vec![1, 2, 3, 4];
        let mut data = START_DELIMITER.to_vec();
        data.extend_from_slice(&payload);
        data.extend_from_slice(&[9, 9, 9]);
        data.extend_from_slice(&END_DELIMITER);

        let mut parser = DelimiterAssembler::new(4);
        assert_eq!(
            parser.process_data(&data),
            vec![DelimitedFrame::Valid(payload)]
        );
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut parser = DelimiterAssembler::new(8);
        let mut data = START_DELIMITER.to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        parser.process_data(&data);
        assert_eq!(parser.state(), ParseState::AccumulatingPayload);
        assert_eq!(parser.buffered(), 3);

        parser.reset();
        assert_eq!(parser.state(), ParseState::AwaitingStart);
        assert_eq!(parser.buffered(), 0);
        assert!(parser.process_data(&[4, 5, 6, 7, 8]).is_empty());
    }

    #[test]
    fn test_waiting_for_end_across_chunks() {
        let mut parser = DelimiterAssembler::new(2);
        let mut first = START_DELIMITER.to_vec();
        first.extend_from_slice(&[7, 8, 0xFF, 0x01]);
        assert!(parser.process_data(&first).is_empty());
        assert_eq!(parser.state(), ParseState::AwaitingEnd);
        assert_eq!(
            parser.process_data(&[0x01, 0xB5]),
            vec![DelimitedFrame::Valid(vec![7, 8])]
        );
    }

    #[test]
    fn test_zero_length_payload() {
        let mut parser = DelimiterAssembler::new(0);
        let mut data = START_DELIMITER.to_vec();
        data.extend_from_slice(&END_DELIMITER);
        assert_eq!(parser.process_data(&data), vec![DelimitedFrame::Valid(vec![])]);
    }
}
