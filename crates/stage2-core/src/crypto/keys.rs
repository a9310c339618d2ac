//! Named key derivation and raw engine passthrough.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use super::{CryptoCapability, CryptoEngine, CryptoOp, CryptoRequest, RegisterBus};
use crate::chip::ChipConfig;
use crate::error::{Result, Stage2Error};

/// Key material pulled from the device. Fields stay `None` when the
/// active engine cannot produce them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMaterial {
    pub engine: Option<CryptoEngine>,
    pub rpmb_key: Option<Vec<u8>>,
    pub rpmb2_key: Option<Vec<u8>>,
    pub fde_key: Option<Vec<u8>>,
    pub itrustee_key: Option<Vec<u8>>,
    pub platform_key: Option<Vec<u8>>,
    pub provisioning_key: Option<Vec<u8>>,
    pub meid: Option<Vec<u8>>,
    pub socid: Option<Vec<u8>>,
}

impl KeyMaterial {
    /// `(file stem, bytes)` for every present entry, in a fixed order.
    pub fn entries(&self) -> Vec<(&'static str, &[u8])> {
        [
            ("rpmb_key", &self.rpmb_key),
            ("rpmb2_key", &self.rpmb2_key),
            ("fde_key", &self.fde_key),
            ("itrustee_key", &self.itrustee_key),
            ("platform_key", &self.platform_key),
            ("provisioning_key", &self.provisioning_key),
            ("meid", &self.meid),
            ("socid", &self.socid),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.as_deref().map(|b| (name, b)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl fmt::Display for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, bytes) in self.entries() {
            writeln!(f, "{:<17} {}", format!("{}:", name), hex::encode(bytes))?;
        }
        Ok(())
    }
}

/// Direct engine operations outside key extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMode {
    SejAesDecrypt,
    SejAesEncrypt,
    DxccSha256,
}

impl RawMode {
    fn target(&self) -> (CryptoEngine, CryptoOp) {
        match self {
            RawMode::SejAesDecrypt => (CryptoEngine::Sej, CryptoOp::CbcDecrypt),
            RawMode::SejAesEncrypt => (CryptoEngine::Sej, CryptoOp::CbcEncrypt),
            RawMode::DxccSha256 => (CryptoEngine::Dxcc, CryptoOp::Sha256),
        }
    }
}

impl FromStr for RawMode {
    type Err = Stage2Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sej_aes_decrypt" | "decrypt" => Ok(RawMode::SejAesDecrypt),
            "sej_aes_encrypt" | "encrypt" => Ok(RawMode::SejAesEncrypt),
            "dxcc_sha256" | "digest" => Ok(RawMode::DxccSha256),
            other => Err(Stage2Error::BadArgument(format!(
                "unknown crypto mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RawMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawMode::SejAesDecrypt => write!(f, "sej_aes_decrypt"),
            RawMode::SejAesEncrypt => write!(f, "sej_aes_encrypt"),
            RawMode::DxccSha256 => write!(f, "dxcc_sha256"),
        }
    }
}

/// Drives the capability on behalf of the session. Nothing is cached:
/// every call re-derives from the engine.
pub struct KeyExtractor<'a> {
    crypto: &'a dyn CryptoCapability,
    chip: &'a ChipConfig,
}

impl<'a> KeyExtractor<'a> {
    pub fn new(crypto: &'a dyn CryptoCapability, chip: &'a ChipConfig) -> Self {
        Self { crypto, chip }
    }

    /// Pick the path the chip supports: every named key on DXCC chips, the
    /// RPMB key alone on SEJ-only chips.
    pub fn extract(
        &self,
        bus: &mut dyn RegisterBus,
        seed: &[u8],
        otp: Option<&[u8]>,
    ) -> Result<KeyMaterial> {
        match self.chip.crypto_engine() {
            Some(CryptoEngine::Dxcc) => self.extract_named_keys(bus),
            Some(CryptoEngine::Sej) => Ok(KeyMaterial {
                engine: Some(CryptoEngine::Sej),
                rpmb_key: Some(self.extract_legacy_key(bus, seed, otp)?),
                ..Default::default()
            }),
            None => Err(self.no_engine()),
        }
    }

    /// All six keys from the full-featured engine.
    pub fn extract_named_keys(&self, bus: &mut dyn RegisterBus) -> Result<KeyMaterial> {
        self.require(CryptoEngine::Dxcc)?;
        let engine = CryptoEngine::Dxcc;

        let rpmb = self.request(bus, CryptoRequest::new(engine, CryptoOp::Rpmb))?;
        let rpmb2 = self.request(bus, CryptoRequest::new(engine, CryptoOp::Rpmb2))?;
        let fde = self.request(bus, CryptoRequest::new(engine, CryptoOp::Fde))?;
        let itrustee = self.request(bus, CryptoRequest::new(engine, CryptoOp::Itrustee))?;
        let (platform, provisioning) = self
            .crypto
            .execute(bus, &CryptoRequest::new(engine, CryptoOp::Prov))?
            .into_pair(CryptoOp::Prov)?;

        info!(chip = %self.chip.name, "Derived DXCC key set");
        Ok(KeyMaterial {
            engine: Some(engine),
            rpmb_key: Some(rpmb),
            rpmb2_key: Some(rpmb2),
            fde_key: Some(fde),
            itrustee_key: Some(itrustee),
            platform_key: Some(platform),
            provisioning_key: Some(provisioning),
            meid: None,
            socid: None,
        })
    }

    /// RPMB key from the legacy engine, seeded by the caller.
    pub fn extract_legacy_key(
        &self,
        bus: &mut dyn RegisterBus,
        seed: &[u8],
        otp: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.require(CryptoEngine::Sej)?;
        let key = self.request(
            bus,
            CryptoRequest::new(CryptoEngine::Sej, CryptoOp::Rpmb)
                .with_data(seed)
                .with_otp(otp),
        )?;
        info!(chip = %self.chip.name, "Derived SEJ RPMB key");
        Ok(key)
    }

    /// Single passthrough request.
    pub fn raw_operation(
        &self,
        bus: &mut dyn RegisterBus,
        mode: RawMode,
        data: &[u8],
        otp: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let (engine, op) = mode.target();
        self.require(engine)?;
        self.request(
            bus,
            CryptoRequest::new(engine, op).with_data(data).with_otp(otp),
        )
    }

    fn request(&self, bus: &mut dyn RegisterBus, request: CryptoRequest<'_>) -> Result<Vec<u8>> {
        debug!(engine = %request.engine, op = %request.op, len = request.data.len(), "Crypto request");
        self.crypto
            .execute(bus, &request)?
            .into_bytes(request.op)
    }

    fn require(&self, engine: CryptoEngine) -> Result<()> {
        let present = match engine {
            CryptoEngine::Dxcc => self.chip.dxcc_base.is_some(),
            CryptoEngine::Sej => self.chip.sej_base.is_some(),
        };
        if present {
            Ok(())
        } else {
            Err(Stage2Error::CryptoUnavailable(format!(
                "{} has no {} engine",
                self.chip.name, engine
            )))
        }
    }

    fn no_engine(&self) -> Stage2Error {
        Stage2Error::CryptoUnavailable(format!(
            "{} has neither a DXCC nor a SEJ engine",
            self.chip.name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipTable;
    use crate::crypto::MockCrypto;
    use crate::framer::CommandFramer;
    use crate::transport::MockTransport;

    fn bus() -> CommandFramer<MockTransport> {
        CommandFramer::new(MockTransport::new())
    }

    #[test]
    fn test_dxcc_chip_yields_all_keys() {
        let chip = ChipTable::builtin().resolve(0x0766);
        let crypto = MockCrypto::new();
        let keys = KeyExtractor::new(&crypto, &chip)
            .extract(&mut bus(), b"ignored", None)
            .unwrap();

        assert_eq!(keys.engine, Some(CryptoEngine::Dxcc));
        assert_eq!(
            keys.rpmb_key.as_deref(),
            Some(MockCrypto::expected(CryptoEngine::Dxcc, CryptoOp::Rpmb, b"").as_slice())
        );
        assert_eq!(keys.platform_key.as_ref().map(Vec::len), Some(16));
        assert_eq!(keys.entries().len(), 6);

        let ops: Vec<CryptoOp> = crypto.calls().iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                CryptoOp::Rpmb,
                CryptoOp::Rpmb2,
                CryptoOp::Fde,
                CryptoOp::Itrustee,
                CryptoOp::Prov
            ]
        );
    }

    #[test]
    fn test_sej_chip_yields_rpmb_only() {
        let chip = ChipTable::builtin().resolve(0x6580);
        let crypto = MockCrypto::new();
        let keys = KeyExtractor::new(&crypto, &chip)
            .extract(&mut bus(), b"seed", Some(b"otp"))
            .unwrap();

        assert_eq!(keys.engine, Some(CryptoEngine::Sej));
        assert_eq!(keys.entries().len(), 1);
        let calls = crypto.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].data, b"seed");
        assert_eq!(calls[0].otp.as_deref(), Some(&b"otp"[..]));
    }

    #[test]
    fn test_no_engine_is_unavailable() {
        let chip = ChipConfig::generic(0x1111);
        let crypto = MockCrypto::new();
        let err = KeyExtractor::new(&crypto, &chip)
            .extract(&mut bus(), &[], None)
            .unwrap_err();
        assert!(matches!(err, Stage2Error::CryptoUnavailable(_)));
        assert!(crypto.calls().is_empty());
    }

    #[test]
    fn test_capability_failure_surfaces() {
        let chip = ChipTable::builtin().resolve(0x0766);
        let crypto = MockCrypto::new();
        crypto.fail_on(CryptoOp::Fde);
        let err = KeyExtractor::new(&crypto, &chip)
            .extract_named_keys(&mut bus())
            .unwrap_err();
        assert!(matches!(err, Stage2Error::CryptoUnavailable(_)));
    }

    #[test]
    fn test_raw_operation_requires_engine() {
        let chip = ChipTable::builtin().resolve(0x6580);
        let crypto = MockCrypto::new();
        let extractor = KeyExtractor::new(&crypto, &chip);

        let out = extractor
            .raw_operation(&mut bus(), RawMode::SejAesEncrypt, b"0123456789abcdef", None)
            .unwrap();
        assert_eq!(
            out,
            MockCrypto::expected(CryptoEngine::Sej, CryptoOp::CbcEncrypt, b"0123456789abcdef")
        );
        assert!(extractor
            .raw_operation(&mut bus(), RawMode::DxccSha256, b"x", None)
            .is_err());
    }

    #[test]
    fn test_raw_mode_parse() {
        assert_eq!("digest".parse::<RawMode>().unwrap(), RawMode::DxccSha256);
        assert_eq!(
            "sej_aes_decrypt".parse::<RawMode>().unwrap(),
            RawMode::SejAesDecrypt
        );
        assert!("rot13".parse::<RawMode>().is_err());
    }
}
