//! Little-endian field encoding for control-transfer payloads
//!
//! All multi-byte device fields are little-endian. Readers return `None` when
//! the buffer is too short instead of panicking, so a short control response
//! surfaces as an error rather than a crash.

/// Length of the streaming probe/commit descriptor in bytes
pub const PROBE_COMMIT_LEN: usize = 34;

/// Read a little-endian `u16` at `offset`
pub fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `offset`
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `i32` at `offset`
pub fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    read_u32_le(buf, offset).map(|v| v as i32)
}

/// Write a little-endian `u16` at `offset`, returning `false` if it does not fit
pub fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) -> bool {
    write_bytes(buf, offset, &value.to_le_bytes())
}

/// Write a little-endian `u32` at `offset`, returning `false` if it does not fit
pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) -> bool {
    write_bytes(buf, offset, &value.to_le_bytes())
}

/// Write a little-endian `i32` at `offset`, returning `false` if it does not fit
pub fn write_i32_le(buf: &mut [u8], offset: usize, value: i32) -> bool {
    write_bytes(buf, offset, &value.to_le_bytes())
}

fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> bool {
    let Some(end) = offset.checked_add(bytes.len()) else {
        return false;
    };
    match buf.get_mut(offset..end) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

/// Video streaming probe/commit control block
///
/// Field offsets follow the class layout:
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0  | 2 | bmHint |
/// | 2  | 1 | bFormatIndex |
/// | 3  | 1 | bFrameIndex |
/// | 4  | 4 | dwFrameInterval (100 ns units) |
/// | 8  | 2 | wKeyFrameRate |
/// | 10 | 2 | wPFrameRate |
/// | 12 | 2 | wCompQuality |
/// | 14 | 2 | wCompWindowSize |
/// | 16 | 2 | wDelay |
/// | 18 | 4 | dwMaxVideoFrameSize |
/// | 22 | 4 | dwMaxPayloadTransferSize |
/// | 26 | 4 | dwClockFrequency |
/// | 30 | 1 | bmFramingInfo |
/// | 31 | 1 | bPreferedVersion |
/// | 32 | 1 | bMinVersion |
/// | 33 | 1 | bMaxVersion |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCommitControl {
    /// Which fields the device should keep fixed
    pub hint: u16,
    /// Video format index (1-based)
    pub format_index: u8,
    /// Frame descriptor index (1-based)
    pub frame_index: u8,
    /// Frame interval in 100 ns units
    pub frame_interval: u32,
    /// Key frame rate
    pub key_frame_rate: u16,
    /// P frame rate
    pub p_frame_rate: u16,
    /// Compression quality
    pub comp_quality: u16,
    /// Compression window size
    pub comp_window_size: u16,
    /// Internal latency in ms
    pub delay: u16,
    /// Maximum video frame size in bytes
    pub max_video_frame_size: u32,
    /// Maximum payload transfer size in bytes
    pub max_payload_transfer_size: u32,
    /// Device clock frequency in Hz
    pub clock_frequency: u32,
    /// Framing info bitmap
    pub framing_info: u8,
    /// Preferred payload format version
    pub preferred_version: u8,
    /// Minimum payload format version
    pub min_version: u8,
    /// Maximum payload format version
    pub max_version: u8,
}

impl ProbeCommitControl {
    /// Encode into the 34-byte wire layout
    pub fn encode(&self) -> [u8; PROBE_COMMIT_LEN] {
        let mut buf = [0u8; PROBE_COMMIT_LEN];
        buf[0..2].copy_from_slice(&self.hint.to_le_bytes());
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        buf[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        buf[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        buf[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        buf[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        buf[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        buf[16..18].copy_from_slice(&self.delay.to_le_bytes());
        buf[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        buf[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        buf[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
        buf[30] = self.framing_info;
        buf[31] = self.preferred_version;
        buf[32] = self.min_version;
        buf[33] = self.max_version;
        buf
    }

    /// Decode from a device response; `None` if shorter than 34 bytes
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROBE_COMMIT_LEN {
            return None;
        }
        Some(Self {
            hint: read_u16_le(buf, 0)?,
            format_index: buf[2],
            frame_index: buf[3],
            frame_interval: read_u32_le(buf, 4)?,
            key_frame_rate: read_u16_le(buf, 8)?,
            p_frame_rate: read_u16_le(buf, 10)?,
            comp_quality: read_u16_le(buf, 12)?,
            comp_window_size: read_u16_le(buf, 14)?,
            delay: read_u16_le(buf, 16)?,
            max_video_frame_size: read_u32_le(buf, 18)?,
            max_payload_transfer_size: read_u32_le(buf, 22)?,
            clock_frequency: read_u32_le(buf, 26)?,
            framing_info: buf[30],
            preferred_version: buf[31],
            min_version: buf[32],
            max_version: buf[33],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_u32_le() {
        let mut buf = [0u8; 6];
        assert!(write_u32_le(&mut buf, 1, 0x1234_5678));
        assert_eq!(buf, [0x00, 0x78, 0x56, 0x34, 0x12, 0x00]);
        assert_eq!(read_u32_le(&buf, 1), Some(0x1234_5678));
    }

    #[test]
    fn test_signed_values_use_twos_complement() {
        let mut buf = [0u8; 4];
        assert!(write_i32_le(&mut buf, 0, -1000));
        assert_eq!(buf, (-1000i32).to_le_bytes());
        assert_eq!(read_i32_le(&buf, 0), Some(-1000));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut buf = [0u8; 3];
        assert!(!write_u32_le(&mut buf, 0, 1));
        assert!(!write_u16_le(&mut buf, 2, 1));
        assert!(!write_u16_le(&mut buf, usize::MAX, 1));
        assert_eq!(read_u16_le(&buf, 2), None);
        assert_eq!(read_u32_le(&[], 0), None);
        assert_eq!(read_u16_le(&buf, usize::MAX), None);
    }

    #[test]
    fn test_probe_commit_layout() {
        let control = ProbeCommitControl {
            format_index: 1,
            frame_index: 2,
            frame_interval: 0x0000_61A7,
            max_video_frame_size: 92_160,
            max_payload_transfer_size: 0x9000,
            clock_frequency: 384_000_000,
            ..Default::default()
        };
        let bytes = control.encode();

        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[0..2], &[0x00, 0x00]);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
        assert_eq!(&bytes[4..8], &[0xA7, 0x61, 0x00, 0x00]);
        assert!(bytes[8..18].iter().all(|&b| b == 0));
        assert_eq!(&bytes[18..22], &[0x00, 0x68, 0x01, 0x00]);
        assert_eq!(&bytes[22..26], &[0x00, 0x90, 0x00, 0x00]);
        assert_eq!(&bytes[26..30], &[0x00, 0x60, 0xE3, 0x16]);
        assert!(bytes[30..34].iter().all(|&b| b == 0));

        assert_eq!(ProbeCommitControl::decode(&bytes), Some(control));
    }

    #[test]
    fn test_probe_commit_decode_short_buffer() {
        assert_eq!(ProbeCommitControl::decode(&[0u8; 26]), None);
    }
}
