//! Security configuration record (v4) generation.
//!
//! ```text
//! 0x00  magic1   0x4D4D4D4D
//! 0x04  version  4
//! 0x08  size     0x3C
//! 0x0C  lock_state
//! 0x10  critical_lock_state
//! 0x14  sboot_runtime
//! 0x18  magic2   0x45454545
//! 0x1C  sealed SHA-256 of 0x00..0x1C (32 bytes)
//! ....  zero padding up to 0x200
//! ```

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::crypto::{CryptoCapability, CryptoEngine, CryptoOp, CryptoRequest, RegisterBus};
use crate::error::{Result, Stage2Error};

pub const SECCFG_MAGIC1: u32 = 0x4D4D_4D4D;
pub const SECCFG_MAGIC2: u32 = 0x4545_4545;
pub const SECCFG_VERSION: u32 = 4;
pub const SECCFG_SIZE: u32 = 0x3C;

pub const RECORD_LEN: usize = 28;
pub const TAG_LEN: usize = 32;
pub const SECCFG_IMAGE_LEN: usize = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFlag {
    Unlock,
    Lock,
}

impl LockFlag {
    /// `(lock_state, critical_lock_state)` written for this intent.
    pub fn states(&self) -> (u32, u32) {
        match self {
            LockFlag::Unlock => (3, 1),
            LockFlag::Lock => (1, 0),
        }
    }
}

impl FromStr for LockFlag {
    type Err = Stage2Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unlock" => Ok(LockFlag::Unlock),
            "lock" => Ok(LockFlag::Lock),
            other => Err(Stage2Error::UnsupportedFlag(other.to_string())),
        }
    }
}

impl fmt::Display for LockFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFlag::Unlock => write!(f, "unlock"),
            LockFlag::Lock => write!(f, "lock"),
        }
    }
}

/// The 28-byte unsealed part of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecCfgRecord {
    pub lock_state: u32,
    pub critical_lock_state: u32,
    pub sboot_runtime: u32,
}

impl SecCfgRecord {
    pub fn new(flag: LockFlag) -> Self {
        let (lock_state, critical_lock_state) = flag.states();
        Self {
            lock_state,
            critical_lock_state,
            sboot_runtime: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        for word in [
            SECCFG_MAGIC1,
            SECCFG_VERSION,
            SECCFG_SIZE,
            self.lock_state,
            self.critical_lock_state,
            self.sboot_runtime,
            SECCFG_MAGIC2,
        ] {
            buf.write_u32::<LittleEndian>(word).unwrap();
        }
        buf
    }

    /// Parse the unsealed part of an existing image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_LEN {
            return Err(Stage2Error::BadArgument(format!(
                "seccfg record needs {} bytes, got {}",
                RECORD_LEN,
                data.len()
            )));
        }
        let mut cursor = Cursor::new(&data[..RECORD_LEN]);
        let mut next = || cursor.read_u32::<LittleEndian>();
        let magic1 = next()?;
        let version = next()?;
        let size = next()?;
        let lock_state = next()?;
        let critical_lock_state = next()?;
        let sboot_runtime = next()?;
        let magic2 = next()?;

        if magic1 != SECCFG_MAGIC1 || magic2 != SECCFG_MAGIC2 {
            return Err(Stage2Error::BadArgument(format!(
                "bad seccfg magic 0x{:08X}/0x{:08X}",
                magic1, magic2
            )));
        }
        if version != SECCFG_VERSION || size != SECCFG_SIZE {
            return Err(Stage2Error::BadArgument(format!(
                "unsupported seccfg version {} size 0x{:X}",
                version, size
            )));
        }

        Ok(Self {
            lock_state,
            critical_lock_state,
            sboot_runtime,
        })
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }
}

/// Builds sealed 512-byte seccfg images.
pub struct SecCfgBuilder<'a> {
    crypto: &'a dyn CryptoCapability,
}

impl<'a> SecCfgBuilder<'a> {
    pub fn new(crypto: &'a dyn CryptoCapability) -> Self {
        Self { crypto }
    }

    pub fn build_from_str(
        &self,
        bus: &mut dyn RegisterBus,
        flag: &str,
        use_software: bool,
    ) -> Result<Vec<u8>> {
        let flag: LockFlag = flag.parse()?;
        self.build(bus, flag, use_software)
    }

    pub fn build(
        &self,
        bus: &mut dyn RegisterBus,
        flag: LockFlag,
        use_software: bool,
    ) -> Result<Vec<u8>> {
        let record = SecCfgRecord::new(flag);
        let digest = record.digest();

        let op = CryptoOp::SealConfig {
            hardware: !use_software,
        };
        let tag = self
            .crypto
            .execute(bus, &CryptoRequest::new(CryptoEngine::Sej, op).with_data(&digest))?
            .into_bytes(op)?;
        if tag.len() != TAG_LEN {
            return Err(Stage2Error::CryptoUnavailable(format!(
                "sealed seccfg tag is {} bytes, expected {}",
                tag.len(),
                TAG_LEN
            )));
        }

        let mut image = record.to_bytes();
        image.extend_from_slice(&tag);
        image.resize(SECCFG_IMAGE_LEN, 0);

        info!(
            flag = %flag,
            lock_state = record.lock_state,
            critical_lock_state = record.critical_lock_state,
            software = use_software,
            "Built seccfg image"
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MockCrypto;
    use crate::framer::CommandFramer;
    use crate::transport::MockTransport;

    #[test]
    fn test_unlock_image() {
        let mut bus = CommandFramer::new(MockTransport::new());
        let crypto = MockCrypto::new();
        let image = SecCfgBuilder::new(&crypto)
            .build(&mut bus, LockFlag::Unlock, true)
            .unwrap();

        assert_eq!(image.len(), SECCFG_IMAGE_LEN);
        assert_eq!(&image[0..4], &[0x4D; 4]);
        assert_eq!(&image[4..8], &4u32.to_le_bytes());
        assert_eq!(&image[8..12], &0x3Cu32.to_le_bytes());
        assert_eq!(&image[12..16], &3u32.to_le_bytes());
        assert_eq!(&image[16..20], &1u32.to_le_bytes());
        assert_eq!(&image[20..24], &0u32.to_le_bytes());
        assert_eq!(&image[24..28], &[0x45; 4]);
        assert!(image[RECORD_LEN + TAG_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_lock_states_and_tag() {
        let mut bus = CommandFramer::new(MockTransport::new());
        let crypto = MockCrypto::new();
        let image = SecCfgBuilder::new(&crypto)
            .build(&mut bus, LockFlag::Lock, false)
            .unwrap();

        let record = SecCfgRecord::parse(&image).unwrap();
        assert_eq!((record.lock_state, record.critical_lock_state), (1, 0));

        let digest = Sha256::digest(&image[..RECORD_LEN]);
        let expected = MockCrypto::expected(
            CryptoEngine::Sej,
            CryptoOp::SealConfig { hardware: true },
            &digest,
        );
        assert_eq!(&image[RECORD_LEN..RECORD_LEN + TAG_LEN], expected.as_slice());

        let calls = crypto.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, CryptoOp::SealConfig { hardware: true });
    }

    #[test]
    fn test_unknown_flag_touches_nothing() {
        let transport = MockTransport::new();
        let mut bus = CommandFramer::new(transport.clone());
        let crypto = MockCrypto::new();
        let err = SecCfgBuilder::new(&crypto)
            .build_from_str(&mut bus, "maybe", true)
            .unwrap_err();

        assert!(matches!(err, Stage2Error::UnsupportedFlag(ref f) if f == "maybe"));
        assert!(crypto.calls().is_empty());
        assert!(transport.get_writes().is_empty());
    }

    #[test]
    fn test_seal_failure_is_crypto_unavailable() {
        let mut bus = CommandFramer::new(MockTransport::new());
        let crypto = MockCrypto::new();
        crypto.fail_on(CryptoOp::SealConfig { hardware: false });
        let err = SecCfgBuilder::new(&crypto)
            .build(&mut bus, LockFlag::Unlock, true)
            .unwrap_err();
        assert!(matches!(err, Stage2Error::CryptoUnavailable(_)));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = SecCfgRecord::new(LockFlag::Unlock).to_bytes();
        bytes[0] = 0;
        assert!(SecCfgRecord::parse(&bytes).is_err());
        assert!(SecCfgRecord::parse(&bytes[..10]).is_err());
    }
}
