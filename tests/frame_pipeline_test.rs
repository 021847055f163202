//! Integration tests for both frame reassembly pipelines.
//!
//! ```text
//! Serial bytes → Delimiter parser → 8-bit + 16-bit queues
//! Bulk chunks  → Payload assembler → Capture loop → Frame queue
//! ```
//!
//! Runs entirely against generated data and mock transports.

use std::time::Duration;

use knokke_scanner::config::FRAME_HEIGHT;
use knokke_scanner::delimiter::{
    find_frame_delimiter, validate_frame, DelimitedFrame, DelimiterAssembler, ParseState,
    END_DELIMITER, START_DELIMITER,
};
use knokke_scanner::frame_assembler::{PayloadAssembler, ProcessResult};
use knokke_scanner::test_utils::{
    envelope, noise_frame, ramp_frame, solid_frame, MockPort, MockPortOpener, MockUsbBackend,
    PayloadGenerator,
};
use knokke_scanner::{
    convert_16bit_to_8bit, convert_8bit_to_16bit, BridgeConfig, BridgeScanner, Scanner,
    UsbConfig,
};

fn bridge() -> BridgeScanner<MockPortOpener> {
    BridgeScanner::new(MockPortOpener::new(), BridgeConfig::default())
}

// ============================================================================
// Delimiter Pipeline: Full-Size Frames
// ============================================================================

#[test]
fn test_single_envelope_yields_one_frame() {
    let bridge = bridge();
    let payload = noise_frame(bridge.frame_size(), 11);
    assert_eq!(payload.len(), 3840 * FRAME_HEIGHT);

    bridge.process_incoming_data(&envelope(&payload));

    let frame = bridge.next_frame().expect("one frame queued");
    assert_eq!(frame.data, payload);
    assert_eq!(bridge.frame_queue_size(), 0);
    assert_eq!(bridge.parse_state(), ParseState::AwaitingStart);
}

#[test]
fn test_companion_16bit_frame() {
    let bridge = bridge();
    let payload = ramp_frame(bridge.frame_size());
    bridge.process_incoming_data(&envelope(&payload));

    let wide = bridge.next_frame_16bit().expect("16-bit frame queued");
    assert_eq!(wide.data.len(), payload.len());
    for (sample, byte) in wide.data.iter().zip(&payload) {
        assert_eq!(*sample, u16::from(*byte) << 8);
    }
    assert_eq!(convert_16bit_to_8bit(&wide.data), payload);
}

#[test]
fn test_round_trip_law_any_length() {
    for len in [0, 1, 3, 255, 4097] {
        let data = noise_frame(len, len as u32 + 1);
        assert_eq!(convert_16bit_to_8bit(&convert_8bit_to_16bit(&data)), data);
    }
}

#[test]
fn test_concatenated_envelopes_in_one_chunk() {
    let bridge = bridge();
    let payloads: Vec<Vec<u8>> = (0..4)
        .map(|i| noise_frame(bridge.frame_size(), 100 + i))
        .collect();
    let stream: Vec<u8> = payloads.iter().flat_map(|p| envelope(p)).collect();

    bridge.process_incoming_data(&stream);

    assert_eq!(bridge.frame_queue_size(), 4);
    assert_eq!(bridge.frame_16bit_queue_size(), 4);
    for (i, payload) in payloads.iter().enumerate() {
        let frame = bridge.next_frame().unwrap();
        assert_eq!(frame.number, i as u64);
        assert_eq!(&frame.data, payload);
    }
    assert_eq!(bridge.total_frames_received(), 4);
}

#[test]
fn test_envelope_split_across_many_chunks() {
    let bridge = bridge();
    let payload = solid_frame(bridge.frame_size(), 0x42);
    let stream = envelope(&payload);

    // Odd chunk size so both delimiters get split
    for chunk in stream.chunks(4093) {
        bridge.process_incoming_data(chunk);
    }

    assert_eq!(bridge.next_frame().map(|f| f.data), Some(payload));
}

#[test]
fn test_end_delimiter_alone_produces_nothing() {
    let bridge = bridge();
    let mut stream = Vec::new();
    for _ in 0..10 {
        stream.extend_from_slice(&END_DELIMITER);
    }
    bridge.process_incoming_data(&stream);

    assert_eq!(bridge.frame_queue_size(), 0);
    assert_eq!(bridge.frames_with_errors(), 0);
    assert_eq!(bridge.parse_state(), ParseState::AwaitingStart);
}

#[test]
fn test_garbage_between_envelopes_is_skipped() {
    let bridge = bridge();
    let first = noise_frame(bridge.frame_size(), 5);
    let second = noise_frame(bridge.frame_size(), 6);

    let mut stream = vec![0x00, 0xFF, 0x01, 0x13];
    stream.extend(envelope(&first));
    stream.extend_from_slice(&[0xAB; 37]);
    stream.extend(envelope(&second));
    bridge.process_incoming_data(&stream);

    assert_eq!(bridge.next_frame().map(|f| f.data), Some(first));
    assert_eq!(bridge.next_frame().map(|f| f.data), Some(second));
}

#[test]
fn test_delimiter_bytes_inside_payload_are_opaque() {
    let bridge = bridge();
    let mut payload = solid_frame(bridge.frame_size(), 0);
    payload[100..104].copy_from_slice(&END_DELIMITER);
    payload[200..204].copy_from_slice(&START_DELIMITER);

    bridge.process_incoming_data(&envelope(&payload));
    assert_eq!(bridge.next_frame().map(|f| f.data), Some(payload));
}

// ============================================================================
// Delimiter Pipeline: Helpers
// ============================================================================

#[test]
fn test_validate_frame_length_only() {
    let size = 3840 * FRAME_HEIGHT;
    assert!(!validate_frame(&[], size));
    assert!(!validate_frame(&vec![0; size - 1], size));
    assert!(!validate_frame(&vec![0; size + 1], size));
    assert!(validate_frame(&vec![0; size], size));
    assert!(validate_frame(&noise_frame(size, 9), size));
}

#[test]
fn test_find_frame_delimiter() {
    let mut data = vec![0u8; 10];
    data.extend_from_slice(&START_DELIMITER);
    assert_eq!(find_frame_delimiter(&data, 0, &START_DELIMITER), Some(10));
    assert_eq!(find_frame_delimiter(&data, 11, &START_DELIMITER), None);
    assert_eq!(find_frame_delimiter(&data, 0, &END_DELIMITER), None);
    assert_eq!(find_frame_delimiter(&data, 100, &START_DELIMITER), None);
}

#[test]
fn test_parser_state_progression() {
    let mut parser = DelimiterAssembler::new(8);
    assert_eq!(parser.state(), ParseState::AwaitingStart);

    assert!(parser.process_data(&START_DELIMITER).is_empty());
    assert_eq!(parser.state(), ParseState::AccumulatingPayload);

    assert!(parser.process_data(&[1; 8]).is_empty());
    assert_eq!(parser.state(), ParseState::AwaitingEnd);

    assert_eq!(
        parser.process_data(&END_DELIMITER),
        vec![DelimitedFrame::Valid(vec![1; 8])]
    );
    assert_eq!(parser.state(), ParseState::AwaitingStart);
}

// ============================================================================
// Delimiter Pipeline: Through the Serial Channel
// ============================================================================

#[test]
fn test_frames_through_data_channel() {
    let data = MockPort::new();
    let opener = MockPortOpener::new()
        .with_port("SE100A", data.clone())
        .with_port("SE100B", MockPort::new());
    let mut bridge = BridgeScanner::new(opener, BridgeConfig::default());
    bridge.open("SE100").unwrap();

    let payload = noise_frame(bridge.frame_size(), 77);
    let stream = envelope(&payload);
    for chunk in stream.chunks(10_000) {
        data.feed(chunk);
    }

    let frame = bridge
        .wait_for_frame(Duration::from_secs(5))
        .unwrap()
        .expect("frame within timeout");
    assert_eq!(frame.data, payload);
    assert_eq!(bridge.total_bytes_processed(), stream.len() as u64);
    bridge.close();
}

// ============================================================================
// Payload-Header Pipeline
// ============================================================================

#[test]
fn test_payload_assembler_full_frame() {
    let config = UsbConfig::default();
    let frame = noise_frame(config.frame_bytes(), 3);
    let mut assembler = PayloadAssembler::new(config.frame_bytes());

    let mut frames = Vec::new();
    for chunk in PayloadGenerator::default().frame_chunks(&frame) {
        if let ProcessResult::Frame(data) = assembler.process_chunk(&chunk) {
            frames.push(data);
        }
    }
    assert_eq!(frames, vec![frame]);
}

#[test]
fn test_payload_assembler_full_headers() {
    let frame = ramp_frame(1000);
    let mut gen = PayloadGenerator::new(300);
    gen.full_headers = true;
    let mut assembler = PayloadAssembler::new(1000);

    let results: Vec<ProcessResult> = gen
        .frame_chunks(&frame)
        .iter()
        .map(|chunk| assembler.process_chunk(chunk))
        .collect();
    assert_eq!(results.last(), Some(&ProcessResult::Frame(frame)));
}

#[test]
fn test_streaming_through_mock_device() {
    let backend = MockUsbBackend::new();
    let device = backend.device();
    let config = UsbConfig {
        bulk_timeout_ms: 2,
        ..UsbConfig::default()
    };
    let frames: Vec<Vec<u8>> = (0..3).map(|i| noise_frame(config.frame_bytes(), i + 1)).collect();
    // Chunks must fit the bulk read buffer
    let mut gen = PayloadGenerator::new(config.bulk_chunk_size / 2);
    for frame in &frames {
        device.queue_chunks(gen.frame_chunks(frame));
    }

    let mut scanner = Scanner::new(backend, config);
    scanner.connect().unwrap();
    scanner.start_streaming().unwrap();

    let mut received = Vec::new();
    while received.len() < frames.len() {
        match scanner.wait_for_frame(Duration::from_secs(5)).unwrap() {
            Some(frame) => received.push(frame),
            None => break,
        }
    }
    scanner.stop_streaming();

    assert_eq!(received.len(), 3);
    for (i, frame) in received.iter().enumerate() {
        assert_eq!(frame.number, i as u64);
        assert_eq!(frame.data, frames[i]);
    }
}

#[test]
fn test_read_cap_abandons_partial_frame() {
    let backend = MockUsbBackend::new();
    let device = backend.device();
    let config = UsbConfig {
        frame_width: 4,
        frame_height: 1,
        bulk_timeout_ms: 2,
        max_reads_per_frame: 3,
        ..UsbConfig::default()
    };
    assert_eq!(config.frame_bytes(), 8);

    // Three reads of a frame that never completes, then a whole frame
    device.queue_chunks((0..3).map(|_| vec![2, 0x00, 7, 7]));
    device.queue_chunks(vec![[vec![2, 0x02], vec![9; 8]].concat()]);

    let mut scanner = Scanner::new(backend, config);
    scanner.connect().unwrap();
    scanner.start_streaming().unwrap();

    let frame = scanner
        .wait_for_frame(Duration::from_secs(5))
        .unwrap()
        .expect("frame after the abandoned one");
    assert_eq!(frame.number, 0);
    assert_eq!(frame.data, vec![9; 8]);
    assert_eq!(scanner.wait_for_frame(Duration::from_millis(50)).unwrap(), None);
    scanner.stop_streaming();
    assert_eq!(device.pending_chunks(), 0);
}
