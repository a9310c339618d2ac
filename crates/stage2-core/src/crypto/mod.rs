//! Hardware crypto capability and key extraction.
//!
//! The engines themselves are driven by a [`CryptoCapability`] supplied by
//! the embedding application. During a request the capability may touch
//! engine registers through the [`RegisterBus`] it is lent; it never owns
//! the link.

pub mod host;
pub mod keys;
pub mod mock;

use std::fmt;

use thiserror::Error;

pub use crate::chip::CryptoEngine;
pub use host::HostCrypto;
pub use keys::{KeyExtractor, KeyMaterial, RawMode};
pub use mock::MockCrypto;

use crate::error::{Result, Stage2Error};
use crate::framer::CommandFramer;
use crate::transport::ByteChannel;

/// Operation requested from an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoOp {
    Rpmb,
    Rpmb2,
    Fde,
    Itrustee,
    /// Returns the (platform, provisioning) key pair.
    Prov,
    CbcDecrypt,
    CbcEncrypt,
    Sha256,
    /// Seal a security-config digest, in software or on the engine.
    SealConfig { hardware: bool },
}

impl fmt::Display for CryptoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoOp::Rpmb => write!(f, "rpmb"),
            CryptoOp::Rpmb2 => write!(f, "rpmb2"),
            CryptoOp::Fde => write!(f, "fde"),
            CryptoOp::Itrustee => write!(f, "itrustee"),
            CryptoOp::Prov => write!(f, "prov"),
            CryptoOp::CbcDecrypt => write!(f, "cbc-decrypt"),
            CryptoOp::CbcEncrypt => write!(f, "cbc-encrypt"),
            CryptoOp::Sha256 => write!(f, "sha256"),
            CryptoOp::SealConfig { hardware: true } => write!(f, "seal-config-hw"),
            CryptoOp::SealConfig { hardware: false } => write!(f, "seal-config-sw"),
        }
    }
}

/// One request to the capability.
#[derive(Debug, Clone, Copy)]
pub struct CryptoRequest<'a> {
    pub engine: CryptoEngine,
    pub op: CryptoOp,
    pub data: &'a [u8],
    pub otp: Option<&'a [u8]>,
}

impl<'a> CryptoRequest<'a> {
    pub fn new(engine: CryptoEngine, op: CryptoOp) -> Self {
        Self {
            engine,
            op,
            data: &[],
            otp: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_otp(mut self, otp: Option<&'a [u8]>) -> Self {
        self.otp = otp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoOutput {
    Bytes(Vec<u8>),
    Pair(Vec<u8>, Vec<u8>),
}

impl CryptoOutput {
    pub fn into_bytes(self, op: CryptoOp) -> Result<Vec<u8>> {
        match self {
            CryptoOutput::Bytes(b) => Ok(b),
            CryptoOutput::Pair(..) => Err(Stage2Error::CryptoUnavailable(format!(
                "{} returned a key pair, expected a single blob",
                op
            ))),
        }
    }

    pub fn into_pair(self, op: CryptoOp) -> Result<(Vec<u8>, Vec<u8>)> {
        match self {
            CryptoOutput::Pair(a, b) => Ok((a, b)),
            CryptoOutput::Bytes(_) => Err(Stage2Error::CryptoUnavailable(format!(
                "{} returned a single blob, expected a key pair",
                op
            ))),
        }
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("{op} not supported on {engine}")]
    Unsupported { engine: CryptoEngine, op: CryptoOp },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Link(#[from] Stage2Error),
}

impl From<CryptoError> for Stage2Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Link(inner) => inner,
            other => Stage2Error::CryptoUnavailable(other.to_string()),
        }
    }
}

/// Register access lent to a capability for the duration of one request.
pub trait RegisterBus {
    fn read32(&mut self, address: u32, count: usize) -> Result<Vec<u32>>;
    fn write32(&mut self, address: u32, values: &[u32]) -> Result<()>;
}

impl<T: ByteChannel> RegisterBus for CommandFramer<T> {
    fn read32(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        CommandFramer::read32(self, address, count)
    }

    fn write32(&mut self, address: u32, values: &[u32]) -> Result<()> {
        CommandFramer::write32(self, address, values)
    }
}

/// Hardware crypto engines as seen by the core.
pub trait CryptoCapability: Send + Sync {
    fn execute(
        &self,
        bus: &mut dyn RegisterBus,
        request: &CryptoRequest<'_>,
    ) -> std::result::Result<CryptoOutput, CryptoError>;
}
