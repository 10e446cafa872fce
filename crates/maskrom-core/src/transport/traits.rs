//! USB transport layer abstraction.
//!
//! Defines the `UsbTransport` trait the session drives, allowing different
//! implementations (nusb, mock, etc.). Every call blocks with an explicit
//! timeout; the trait holds no protocol knowledge.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no maskrom device found at index {index}")]
    DeviceNotFound { index: usize },

    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    /// The endpoint stalled. The ROM answers opcodes it does not implement
    /// this way.
    #[error("endpoint stalled")]
    Stall,

    /// The device returned more bytes than the transfer requested.
    #[error("inbound transfer overflowed the requested length")]
    Overflow,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("control transfer failed: {0}")]
    ControlFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error means the device refused the transfer outright,
    /// as opposed to the link failing. A refused command frame classifies
    /// the whole request as unsupported.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TransportError::Stall | TransportError::WriteFailed(_)
        )
    }
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Write raw bytes to the bulk OUT endpoint.
    fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `len` raw bytes from the bulk IN endpoint.
    fn bulk_read(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Deliver one chunk of a prepared boot image via the vendor load
    /// control transfer, addressed to the SRAM or DRAM slot by `index`.
    fn vendor_load(&self, index: u16, chunk: &[u8], timeout: Duration)
    -> Result<(), TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
