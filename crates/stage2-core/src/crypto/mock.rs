//! Recording capability for tests.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use super::{
    CryptoCapability, CryptoEngine, CryptoError, CryptoOp, CryptoOutput, CryptoRequest,
    RegisterBus,
};

/// A request as seen by [`MockCrypto`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub engine: CryptoEngine,
    pub op: CryptoOp,
    pub data: Vec<u8>,
    pub otp: Option<Vec<u8>>,
}

/// Deterministic capability: every operation answers with bytes derived
/// from its name, engine and input, so tests can recompute them.
#[derive(Clone, Default)]
pub struct MockCrypto {
    calls: Arc<Mutex<Vec<RecordedRequest>>>,
    fail: Arc<Mutex<Option<CryptoOp>>>,
}

impl MockCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail from now on.
    pub fn fail_on(&self, op: CryptoOp) {
        *self.fail.lock().unwrap() = Some(op);
    }

    pub fn calls(&self) -> Vec<RecordedRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// The 32 bytes this mock returns for `(engine, op, data)`.
    pub fn expected(engine: CryptoEngine, op: CryptoOp, data: &[u8]) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(engine.to_string().as_bytes());
        h.update(op.to_string().as_bytes());
        h.update(data);
        h.finalize().to_vec()
    }
}

impl CryptoCapability for MockCrypto {
    fn execute(
        &self,
        _bus: &mut dyn RegisterBus,
        request: &CryptoRequest<'_>,
    ) -> Result<CryptoOutput, CryptoError> {
        self.calls.lock().unwrap().push(RecordedRequest {
            engine: request.engine,
            op: request.op,
            data: request.data.to_vec(),
            otp: request.otp.map(<[u8]>::to_vec),
        });

        if *self.fail.lock().unwrap() == Some(request.op) {
            return Err(CryptoError::Failed(format!("{} failed", request.op)));
        }

        let out = Self::expected(request.engine, request.op, request.data);
        Ok(match request.op {
            CryptoOp::Prov => CryptoOutput::Pair(out[..16].to_vec(), out[16..].to_vec()),
            _ => CryptoOutput::Bytes(out),
        })
    }
}
