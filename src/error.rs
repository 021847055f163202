//! Error taxonomy shared by both scanner variants
//!
//! Every public driver operation returns [`Result`]. Failures that happen on
//! background threads never reach a caller directly; they are reported as an
//! [`ErrorCode`] plus message through the registered error callback.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// libusb status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum UsbError {
    /// Not an error, kept so raw codes round-trip
    Success = 0,
    /// Input/output error
    IoError = -1,
    /// Invalid parameter
    InvalidParam = -2,
    /// Access denied (insufficient permissions)
    Access = -3,
    /// No such device (it may have been disconnected)
    NoDevice = -4,
    /// Entity not found
    NotFound = -5,
    /// Resource busy
    Busy = -6,
    /// Operation timed out
    Timeout = -7,
    /// Overflow
    Overflow = -8,
    /// Pipe error (endpoint halted or request not supported)
    Pipe = -9,
    /// System call interrupted
    Interrupted = -10,
    /// Insufficient memory
    NoMem = -11,
    /// Operation not supported or unimplemented on this platform
    NotSupported = -12,
    /// Any other code
    Other = -99,
}

impl From<i32> for UsbError {
    fn from(code: i32) -> Self {
        match code {
            0 => UsbError::Success,
            -1 => UsbError::IoError,
            -2 => UsbError::InvalidParam,
            -3 => UsbError::Access,
            -4 => UsbError::NoDevice,
            -5 => UsbError::NotFound,
            -6 => UsbError::Busy,
            -7 => UsbError::Timeout,
            -8 => UsbError::Overflow,
            -9 => UsbError::Pipe,
            -10 => UsbError::Interrupted,
            -11 => UsbError::NoMem,
            -12 => UsbError::NotSupported,
            _ => UsbError::Other,
        }
    }
}

impl UsbError {
    /// Raw libusb status code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Symbolic libusb name, as printed by `libusb_error_name`
    pub fn name(self) -> &'static str {
        match self {
            UsbError::Success => "LIBUSB_SUCCESS",
            UsbError::IoError => "LIBUSB_ERROR_IO",
            UsbError::InvalidParam => "LIBUSB_ERROR_INVALID_PARAM",
            UsbError::Access => "LIBUSB_ERROR_ACCESS",
            UsbError::NoDevice => "LIBUSB_ERROR_NO_DEVICE",
            UsbError::NotFound => "LIBUSB_ERROR_NOT_FOUND",
            UsbError::Busy => "LIBUSB_ERROR_BUSY",
            UsbError::Timeout => "LIBUSB_ERROR_TIMEOUT",
            UsbError::Overflow => "LIBUSB_ERROR_OVERFLOW",
            UsbError::Pipe => "LIBUSB_ERROR_PIPE",
            UsbError::Interrupted => "LIBUSB_ERROR_INTERRUPTED",
            UsbError::NoMem => "LIBUSB_ERROR_NO_MEM",
            UsbError::NotSupported => "LIBUSB_ERROR_NOT_SUPPORTED",
            UsbError::Other => "LIBUSB_ERROR_OTHER",
        }
    }
}

impl std::fmt::Display for UsbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbError::Success => write!(f, "Success"),
            UsbError::IoError => write!(f, "I/O error"),
            UsbError::InvalidParam => write!(f, "Invalid parameter"),
            UsbError::Access => write!(f, "Access denied"),
            UsbError::NoDevice => write!(f, "No such device"),
            UsbError::NotFound => write!(f, "Entity not found"),
            UsbError::Busy => write!(f, "Resource busy"),
            UsbError::Timeout => write!(f, "Operation timed out"),
            UsbError::Overflow => write!(f, "Overflow"),
            UsbError::Pipe => write!(f, "Pipe error"),
            UsbError::Interrupted => write!(f, "System call interrupted"),
            UsbError::NoMem => write!(f, "Insufficient memory"),
            UsbError::NotSupported => write!(f, "Operation not supported"),
            UsbError::Other => write!(f, "Other error"),
        }
    }
}

impl std::error::Error for UsbError {}

/// Coarse classification of a [`ScannerError`], handed to error callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No device with the configured identity is attached
    DeviceNotFound,
    /// The device was found but could not be opened or claimed
    DeviceOpenFailed,
    /// The operation needs a live connection
    DeviceNotConnected,
    /// A control request was rejected or timed out
    ControlTransferFailed,
    /// Streaming is already running
    StreamingAlreadyStarted,
    /// Streaming is not running
    StreamingNotStarted,
    /// A background thread could not be spawned
    ThreadCreationFailed,
    /// An argument was out of range
    InvalidParameter,
    /// Transport-level failure carrying a status code
    TransportError,
    /// Anything else
    UnknownError,
}

impl ErrorCode {
    /// Fixed human-readable text for this code
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::DeviceNotFound => "Device not found",
            ErrorCode::DeviceOpenFailed => "Failed to open device",
            ErrorCode::DeviceNotConnected => "Device not connected",
            ErrorCode::ControlTransferFailed => "Control transfer failed",
            ErrorCode::StreamingAlreadyStarted => "Streaming already started",
            ErrorCode::StreamingNotStarted => "Streaming not started",
            ErrorCode::ThreadCreationFailed => "Thread creation failed",
            ErrorCode::InvalidParameter => "Invalid parameter",
            ErrorCode::TransportError => "USB error",
            ErrorCode::UnknownError => "Unknown error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors returned by scanner operations.
#[derive(Error, Debug)]
pub enum ScannerError {
    /// No matching device is attached.
    #[error("device not found")]
    DeviceNotFound,

    /// Opening, configuring or claiming the device failed.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// The operation requires a connected device.
    #[error("device not connected")]
    DeviceNotConnected,

    /// A control request failed at the transport level.
    #[error("control transfer failed: {} ({})", .0, .0.name())]
    ControlTransferFailed(UsbError),

    /// Streaming was requested while already running.
    #[error("streaming already started")]
    StreamingAlreadyStarted,

    /// The operation requires an active stream.
    #[error("streaming not started")]
    StreamingNotStarted,

    /// A background thread could not be spawned.
    #[error("failed to create thread: {0}")]
    ThreadCreationFailed(String),

    /// An argument was rejected before any I/O.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic USB transport failure.
    #[error("USB error: {} ({})", .0, .0.name())]
    Usb(UsbError),

    /// I/O failure on a serial-bridge channel.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything that fits no other category.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ScannerError {
    /// Classification used by error callbacks
    pub fn code(&self) -> ErrorCode {
        match self {
            ScannerError::DeviceNotFound => ErrorCode::DeviceNotFound,
            ScannerError::DeviceOpenFailed(_) => ErrorCode::DeviceOpenFailed,
            ScannerError::DeviceNotConnected => ErrorCode::DeviceNotConnected,
            ScannerError::ControlTransferFailed(_) => ErrorCode::ControlTransferFailed,
            ScannerError::StreamingAlreadyStarted => ErrorCode::StreamingAlreadyStarted,
            ScannerError::StreamingNotStarted => ErrorCode::StreamingNotStarted,
            ScannerError::ThreadCreationFailed(_) => ErrorCode::ThreadCreationFailed,
            ScannerError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            ScannerError::Usb(_) | ScannerError::Io(_) => ErrorCode::TransportError,
            ScannerError::Unknown(_) => ErrorCode::UnknownError,
        }
    }
}

impl From<serialport::Error> for ScannerError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ScannerError::DeviceNotFound,
            serialport::ErrorKind::Io(kind) => {
                ScannerError::Io(std::io::Error::new(kind, e.description))
            }
            _ => ScannerError::DeviceOpenFailed(e.description),
        }
    }
}

/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, ScannerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_from_code() {
        assert_eq!(UsbError::from(-7), UsbError::Timeout);
        assert_eq!(UsbError::from(-9), UsbError::Pipe);
        assert_eq!(UsbError::from(-4), UsbError::NoDevice);
        assert_eq!(UsbError::from(-1234), UsbError::Other);
        assert_eq!(UsbError::Timeout.code(), -7);
    }

    #[test]
    fn test_usb_error_name() {
        assert_eq!(UsbError::Timeout.name(), "LIBUSB_ERROR_TIMEOUT");
        assert_eq!(UsbError::NoDevice.name(), "LIBUSB_ERROR_NO_DEVICE");
    }

    #[test]
    fn test_scanner_error_codes() {
        assert_eq!(
            ScannerError::DeviceNotConnected.code(),
            ErrorCode::DeviceNotConnected
        );
        assert_eq!(
            ScannerError::ControlTransferFailed(UsbError::Pipe).code(),
            ErrorCode::ControlTransferFailed
        );
        assert_eq!(
            ScannerError::Usb(UsbError::Timeout).code(),
            ErrorCode::TransportError
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(ScannerError::from(io).code(), ErrorCode::TransportError);
    }

    #[test]
    fn test_error_display_includes_libusb_name() {
        let msg = ScannerError::Usb(UsbError::Timeout).to_string();
        assert!(msg.contains("LIBUSB_ERROR_TIMEOUT"), "got {msg}");
    }

    #[test]
    fn test_error_code_messages() {
        assert_eq!(ErrorCode::DeviceNotFound.message(), "Device not found");
        assert_eq!(ErrorCode::TransportError.message(), "USB error");
        assert_eq!(ErrorCode::UnknownError.to_string(), "Unknown error");
    }
}
