//! Acknowledgement parsing and matching.
//!
//! The agent answers state-changing commands with a 4-byte status word.
//! Success is signalled by a repeated byte pattern; anything else,
//! including a short answer, is a failure.

use std::fmt;

use super::constants::{ACK_EMMC_OK, ACK_LEN, ACK_WRITE_OK};

/// Acknowledgement received from the agent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    bytes: [u8; ACK_LEN],
    /// Number of bytes actually received (0..=4).
    len: u8,
}

impl Ack {
    /// Build an ack from raw received bytes. Extra bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes.len().min(ACK_LEN);
        let mut buf = [0u8; ACK_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            bytes: buf,
            len: len as u8,
        }
    }

    /// Raw bytes as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Little-endian interpretation, zero-extended when short.
    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check against a full 4-byte pattern.
    pub fn matches(&self, expected: &[u8; ACK_LEN]) -> bool {
        self.len as usize == ACK_LEN && &self.bytes == expected
    }

    /// Memory write accepted.
    pub fn is_write_ok(&self) -> bool {
        self.matches(&ACK_WRITE_OK)
    }

    /// Storage controller initialised.
    pub fn is_emmc_ok(&self) -> bool {
        self.matches(&ACK_EMMC_OK)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ack({})", self)
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<none>");
        }
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_ack() {
        let ack = Ack::from_bytes(&[0xD0, 0xD0, 0xD0, 0xD0]);
        assert!(ack.is_write_ok());
        assert!(!ack.is_emmc_ok());
        assert_eq!(ack.value(), 0xD0D0D0D0);
    }

    #[test]
    fn test_short_ack_never_matches() {
        let ack = Ack::from_bytes(&[0xD0, 0xD0]);
        assert_eq!(ack.len(), 2);
        assert!(!ack.is_write_ok());
        assert_eq!(ack.to_string(), "D0D0");
    }

    #[test]
    fn test_empty_ack() {
        let ack = Ack::from_bytes(&[]);
        assert!(ack.is_empty());
        assert_eq!(ack.to_string(), "<none>");
    }
}
