//! Error taxonomy for stage2 operations.

use thiserror::Error;

use crate::protocol::Ack;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Stage2Error {
    /// Transport fault. The link is unusable afterwards.
    #[error("Link error: {0}")]
    Link(#[from] TransportError),

    /// A frame boundary was violated; the link is out of sync.
    #[error("{operation}: protocol desync at 0x{address:08X}, expected {expected} bytes, got {actual}")]
    ProtocolDesync {
        operation: &'static str,
        address: u32,
        expected: usize,
        actual: usize,
    },

    /// A command was answered with something other than its success ack.
    #[error("{operation}: unexpected ack {ack}, expected {expected}")]
    UnexpectedAck {
        operation: &'static str,
        expected: Ack,
        ack: Ack,
    },

    /// A storage sector came back shorter than the region's sector size.
    #[error("{operation}: short read at sector {sector}, expected {expected} bytes, got {actual}")]
    ShortRead {
        operation: &'static str,
        sector: u32,
        expected: usize,
        actual: usize,
    },

    /// A memory write chunk was not acknowledged. Everything from `address`
    /// onward in the requested range is indeterminate.
    #[error("Write rejected at 0x{address:08X} ({length} bytes), ack {ack}")]
    WriteRejected { address: u32, length: usize, ack: Ack },

    #[error("Crypto unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Unsupported lock flag '{0}', expected 'unlock' or 'lock'")]
    UnsupportedFlag(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// The observer requested an abort between two sectors or chunks.
    #[error("{operation}: cancelled after {completed} of {total} units")]
    Cancelled {
        operation: &'static str,
        completed: u64,
        total: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Stage2Error {
    /// Transport faults leave the link unusable. Framing errors do not: the
    /// whole operation may be retried from scratch.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Stage2Error::Link(_))
    }
}

pub type Result<T> = std::result::Result<T, Stage2Error>;
