//! Byte channel abstraction.
//!
//! Everything above the transport sees the agent as a blocking, ordered
//! byte pipe. Real hardware goes through nusb; tests use the emulated agent
//! in [`super::mock`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// No device with a matching VID/PID is enumerated.
    #[error("No stage2 device found (VID={vid:04X} PID={pid:04X})")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Cannot open device: {0}")]
    OpenFailed(String),

    #[error("Cannot claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("No {ep_type} {direction} endpoint")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Bulk OUT failed: {0}")]
    WriteFailed(String),

    #[error("Bulk IN failed: {0}")]
    ReadFailed(String),

    /// The device went away, or the agent rebooted it.
    #[error("Device disconnected")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Blocking byte channel to the stage2 agent.
///
/// There is no timeout: a silent device blocks the caller.
pub trait ByteChannel: Send + Sync {
    /// Send `data` as one bulk transfer.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read `len` bytes. Fewer bytes are returned only when the link
    /// faulted mid-transfer.
    fn read(&self, len: usize) -> Result<Vec<u8>, TransportError>;

    fn is_connected(&self) -> bool;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}
