//! Scanner parameters and their control-request mapping
//!
//! Each logical parameter lives behind a (selector, unit) pair and has a fixed
//! payload width. Values travel little-endian.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::codec::{read_i32_le, read_u16_le, read_u32_le, PROBE_COMMIT_LEN};
use crate::error::{Result, ScannerError};

/// Class-specific request codes and request types
pub mod request {
    /// Set current value
    pub const SET_CUR: u8 = 0x01;
    /// Get current value
    pub const GET_CUR: u8 = 0x81;
    /// Class request, interface recipient, device-to-host
    pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;
    /// Class request, interface recipient, host-to-device
    pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
}

/// Unit identifiers (`wIndex`: entity id in the high byte, interface in the low byte)
pub mod unit {
    /// Camera terminal on the control interface
    pub const CAMERA_TERMINAL: u16 = 0x0100;
    /// Vendor extension unit on the control interface
    pub const EXTENSION_UNIT: u16 = 0x0300;
    /// Video streaming interface
    pub const STREAMING_INTERFACE: u16 = 0x0001;
}

/// Direction of a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device-to-host (`GET_CUR`)
    In,
    /// Host-to-device (`SET_CUR`)
    Out,
}

impl Direction {
    /// `bmRequestType` for this direction
    pub fn request_type(self) -> u8 {
        match self {
            Direction::In => request::REQUEST_TYPE_CLASS_IN,
            Direction::Out => request::REQUEST_TYPE_CLASS_OUT,
        }
    }

    /// `bRequest` for this direction
    pub fn request(self) -> u8 {
        match self {
            Direction::In => request::GET_CUR,
            Direction::Out => request::SET_CUR,
        }
    }
}

/// Device controls reachable through class requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// Exposure time, `u32` microseconds
    ExposureTime,
    /// Analog gain, `u16` in dB x 100
    Gain,
    /// RGB backlight, 3 x `u16`
    Backlight,
    /// Motor speed, `i32` in steps/s x 1000
    MotorSpeed,
    /// Firmware update trigger, single byte
    Update,
    /// Streaming probe
    Probe,
    /// Streaming commit
    Commit,
}

impl Control {
    /// Control selector (`wValue`)
    pub fn selector(self) -> u16 {
        match self {
            Control::ExposureTime => 0x0300,
            Control::Gain => 0x0100,
            Control::Backlight => 0x0100,
            Control::MotorSpeed => 0x0200,
            Control::Update => 0x0300,
            Control::Probe => 0x0100,
            Control::Commit => 0x0200,
        }
    }

    /// Unit identifier (`wIndex`)
    pub fn unit(self) -> u16 {
        match self {
            Control::ExposureTime | Control::Gain => unit::CAMERA_TERMINAL,
            Control::Backlight | Control::MotorSpeed | Control::Update => unit::EXTENSION_UNIT,
            Control::Probe | Control::Commit => unit::STREAMING_INTERFACE,
        }
    }

    /// Payload width in bytes
    pub fn width(self) -> usize {
        match self {
            Control::ExposureTime => 4,
            Control::Gain => 2,
            Control::Backlight => 6,
            Control::MotorSpeed => 4,
            Control::Update => 1,
            Control::Probe | Control::Commit => PROBE_COMMIT_LEN,
        }
    }
}

/// One of the three backlight channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BacklightChannel {
    /// Red LED
    Red,
    /// Green LED
    Green,
    /// Blue LED
    Blue,
}

impl BacklightChannel {
    /// Parse `r`, `g` or `b` (case-insensitive)
    ///
    /// # Errors
    ///
    /// Returns [`ScannerError::InvalidParameter`] for any other character.
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_lowercase() {
            'r' => Ok(BacklightChannel::Red),
            'g' => Ok(BacklightChannel::Green),
            'b' => Ok(BacklightChannel::Blue),
            other => Err(ScannerError::InvalidParameter(format!(
                "unknown backlight channel '{other}'"
            ))),
        }
    }
}

impl FromStr for BacklightChannel {
    type Err = ScannerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "red" => Ok(BacklightChannel::Red),
            "green" => Ok(BacklightChannel::Green),
            "blue" => Ok(BacklightChannel::Blue),
            _ => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Self::from_char(c),
                    _ => Err(ScannerError::InvalidParameter(format!(
                        "unknown backlight channel '{s}'"
                    ))),
                }
            }
        }
    }
}

/// RGB backlight intensities, always transferred as one 6-byte group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklightParameters {
    /// Red intensity
    pub red: u16,
    /// Green intensity
    pub green: u16,
    /// Blue intensity
    pub blue: u16,
}

impl BacklightParameters {
    /// Construct from the three channel values
    pub fn new(red: u16, green: u16, blue: u16) -> Self {
        Self { red, green, blue }
    }

    /// Value of a single channel
    pub fn channel(&self, channel: BacklightChannel) -> u16 {
        match channel {
            BacklightChannel::Red => self.red,
            BacklightChannel::Green => self.green,
            BacklightChannel::Blue => self.blue,
        }
    }

    /// Copy with one channel replaced
    pub fn with_channel(mut self, channel: BacklightChannel, value: u16) -> Self {
        match channel {
            BacklightChannel::Red => self.red = value,
            BacklightChannel::Green => self.green = value,
            BacklightChannel::Blue => self.blue = value,
        }
        self
    }

    /// Wire layout: R, G, B as little-endian `u16`
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..2].copy_from_slice(&self.red.to_le_bytes());
        buf[2..4].copy_from_slice(&self.green.to_le_bytes());
        buf[4..6].copy_from_slice(&self.blue.to_le_bytes());
        buf
    }

    /// Decode the 6-byte group; `None` if the buffer is short
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        Some(Self {
            red: read_u16_le(buf, 0)?,
            green: read_u16_le(buf, 2)?,
            blue: read_u16_le(buf, 4)?,
        })
    }
}

/// Full parameter set, read and written as four sequential requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerParameters {
    /// Exposure time in microseconds
    pub exposure_time_us: u32,
    /// Gain in dB x 100
    pub gain: u16,
    /// Backlight intensities
    pub backlight: BacklightParameters,
    /// Motor speed in steps/s x 1000
    pub motor_speed: i32,
}

/// Decode helpers for single-value controls
pub(crate) fn decode_exposure(buf: &[u8]) -> Option<u32> {
    read_u32_le(buf, 0)
}

pub(crate) fn decode_gain(buf: &[u8]) -> Option<u16> {
    read_u16_le(buf, 0)
}

pub(crate) fn decode_motor_speed(buf: &[u8]) -> Option<i32> {
    read_i32_le(buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_mapping() {
        assert_eq!(
            (Control::ExposureTime.selector(), Control::ExposureTime.unit()),
            (0x0300, 0x0100)
        );
        assert_eq!((Control::Gain.selector(), Control::Gain.unit()), (0x0100, 0x0100));
        assert_eq!(
            (Control::Backlight.selector(), Control::Backlight.unit()),
            (0x0100, 0x0300)
        );
        assert_eq!(
            (Control::MotorSpeed.selector(), Control::MotorSpeed.unit()),
            (0x0200, 0x0300)
        );
        assert_eq!((Control::Update.selector(), Control::Update.unit()), (0x0300, 0x0300));
        assert_eq!((Control::Probe.selector(), Control::Probe.unit()), (0x0100, 0x0001));
        assert_eq!((Control::Commit.selector(), Control::Commit.unit()), (0x0200, 0x0001));
    }

    #[test]
    fn test_control_widths() {
        assert_eq!(Control::ExposureTime.width(), 4);
        assert_eq!(Control::Gain.width(), 2);
        assert_eq!(Control::Backlight.width(), 6);
        assert_eq!(Control::MotorSpeed.width(), 4);
        assert_eq!(Control::Update.width(), 1);
        assert_eq!(Control::Probe.width(), 34);
    }

    #[test]
    fn test_direction_codes() {
        assert_eq!(Direction::In.request_type(), 0xA1);
        assert_eq!(Direction::In.request(), 0x81);
        assert_eq!(Direction::Out.request_type(), 0x21);
        assert_eq!(Direction::Out.request(), 0x01);
    }

    #[test]
    fn test_backlight_wire_layout() {
        let backlight = BacklightParameters::new(0x0102, 0xA0B0, 0xFFFF);
        assert_eq!(backlight.to_bytes(), [0x02, 0x01, 0xB0, 0xA0, 0xFF, 0xFF]);
        assert_eq!(
            BacklightParameters::from_bytes(&backlight.to_bytes()),
            Some(backlight)
        );
        assert_eq!(BacklightParameters::from_bytes(&[0u8; 5]), None);
    }

    #[test]
    fn test_backlight_with_channel() {
        let base = BacklightParameters::new(1, 2, 3);
        let updated = base.with_channel(BacklightChannel::Green, 500);
        assert_eq!(updated, BacklightParameters::new(1, 500, 3));
        assert_eq!(updated.channel(BacklightChannel::Green), 500);
        assert_eq!(updated.channel(BacklightChannel::Blue), 3);
    }

    #[test]
    fn test_channel_parsing() {
        assert_eq!(BacklightChannel::from_char('r').unwrap(), BacklightChannel::Red);
        assert_eq!(BacklightChannel::from_char('G').unwrap(), BacklightChannel::Green);
        assert_eq!(BacklightChannel::from_char('b').unwrap(), BacklightChannel::Blue);
        assert!(matches!(
            BacklightChannel::from_char('x'),
            Err(ScannerError::InvalidParameter(_))
        ));
        assert_eq!("blue".parse::<BacklightChannel>().unwrap(), BacklightChannel::Blue);
        assert_eq!("R".parse::<BacklightChannel>().unwrap(), BacklightChannel::Red);
        assert!("purple".parse::<BacklightChannel>().is_err());
    }

    #[test]
    fn test_scalar_decoders() {
        assert_eq!(decode_exposure(&[0xFF, 0xFF, 0xFF, 0xFF]), Some(u32::MAX));
        assert_eq!(decode_gain(&[0x10, 0x27]), Some(10_000));
        assert_eq!(decode_motor_speed(&(-5000i32).to_le_bytes()), Some(-5000));
        assert_eq!(decode_gain(&[0x10]), None);
    }

    #[test]
    fn test_parameters_serde() {
        let params = ScannerParameters {
            exposure_time_us: 1000,
            gain: 250,
            backlight: BacklightParameters::new(10, 20, 30),
            motor_speed: -42,
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: ScannerParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
