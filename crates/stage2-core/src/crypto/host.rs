//! Host-side capability: software digests and the software seccfg seal.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use super::{CryptoCapability, CryptoError, CryptoOp, CryptoOutput, CryptoRequest, RegisterBus};

/// Fixed AES-128 key of the software seccfg seal.
pub const SW_SEAL_KEY: [u8; 16] = [
    0x25, 0xA1, 0x76, 0x3A, 0x21, 0xBC, 0x85, 0x4C, 0xD5, 0x69, 0xDC, 0x23, 0xB4, 0x78, 0x2B, 0x63,
];
pub const SW_SEAL_IV: [u8; 16] = [
    0x57, 0x32, 0x5A, 0x5A, 0x12, 0x54, 0x97, 0x66, 0x12, 0x54, 0x97, 0x66, 0x57, 0x32, 0x5A, 0x5A,
];

const AES_BLOCK: usize = 16;

/// Capability that runs on the host without touching the device.
///
/// Provides `sha256` and `SealConfig { hardware: false }`. Every key-slot
/// operation needs the SoC's engine and is reported as unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCrypto;

/// AES-128-CBC with the fixed software key, no padding.
pub fn software_seal(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || data.len() % AES_BLOCK != 0 {
        return Err(CryptoError::Failed(format!(
            "software seal needs whole {}-byte blocks, got {} bytes",
            AES_BLOCK,
            data.len()
        )));
    }
    let cipher = cbc::Encryptor::<Aes128>::new(&SW_SEAL_KEY.into(), &SW_SEAL_IV.into());
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
}

impl CryptoCapability for HostCrypto {
    fn execute(
        &self,
        _bus: &mut dyn RegisterBus,
        request: &CryptoRequest<'_>,
    ) -> Result<CryptoOutput, CryptoError> {
        match request.op {
            CryptoOp::Sha256 => Ok(CryptoOutput::Bytes(Sha256::digest(request.data).to_vec())),
            CryptoOp::SealConfig { hardware: false } => {
                software_seal(request.data).map(CryptoOutput::Bytes)
            }
            op => Err(CryptoError::Unsupported {
                engine: request.engine,
                op,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::CryptoEngine;
    use crate::framer::CommandFramer;
    use crate::transport::MockTransport;
    use cbc::cipher::BlockDecryptMut;

    #[test]
    fn test_host_sha256() {
        let mut bus = CommandFramer::new(MockTransport::new());
        let out = HostCrypto
            .execute(
                &mut bus,
                &CryptoRequest::new(CryptoEngine::Dxcc, CryptoOp::Sha256).with_data(b"abc"),
            )
            .unwrap();
        assert_eq!(
            out,
            CryptoOutput::Bytes(
                hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                    .unwrap()
            )
        );
        assert!(bus.channel().get_writes().is_empty());
    }

    #[test]
    fn test_software_seal_is_cbc_under_fixed_key() {
        let mut bus = CommandFramer::new(MockTransport::new());
        let digest = Sha256::digest(b"seccfg");
        let out = HostCrypto
            .execute(
                &mut bus,
                &CryptoRequest::new(CryptoEngine::Sej, CryptoOp::SealConfig { hardware: false })
                    .with_data(&digest),
            )
            .unwrap()
            .into_bytes(CryptoOp::SealConfig { hardware: false })
            .unwrap();
        assert_eq!(out.len(), 32);
        assert_ne!(out.as_slice(), digest.as_slice());

        let plain = cbc::Decryptor::<Aes128>::new(&SW_SEAL_KEY.into(), &SW_SEAL_IV.into())
            .decrypt_padded_vec_mut::<NoPadding>(&out)
            .unwrap();
        assert_eq!(plain.as_slice(), digest.as_slice());
        assert!(bus.channel().get_writes().is_empty());
    }

    #[test]
    fn test_software_seal_rejects_partial_block() {
        assert!(matches!(software_seal(&[0u8; 20]), Err(CryptoError::Failed(_))));
        assert!(matches!(software_seal(&[]), Err(CryptoError::Failed(_))));
    }

    #[test]
    fn test_host_rejects_key_ops() {
        let mut bus = CommandFramer::new(MockTransport::new());
        for op in [CryptoOp::Rpmb, CryptoOp::SealConfig { hardware: true }] {
            let err = HostCrypto
                .execute(&mut bus, &CryptoRequest::new(CryptoEngine::Sej, op))
                .unwrap_err();
            assert!(matches!(err, CryptoError::Unsupported { .. }));
        }
    }
}
