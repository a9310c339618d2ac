//! Command framer: the only component that touches the byte channel.
//!
//! Every exchange is one frame out, then either an acknowledgement or a
//! fixed-length payload back. Nothing here retries; a short answer is
//! reported and the caller decides what to do with the session.

use tracing::{debug, trace};

use crate::error::{Result, Stage2Error};
use crate::protocol::{Ack, Frame, ACK_LEN, CMD_READ_MEM, CMD_WRITE_MEM};
use crate::transport::ByteChannel;

pub struct CommandFramer<T: ByteChannel> {
    channel: T,
}

impl<T: ByteChannel> CommandFramer<T> {
    pub fn new(channel: T) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &T {
        &self.channel
    }

    pub fn into_inner(self) -> T {
        self.channel
    }

    /// Transmit a frame, one bulk transfer per field.
    pub fn send_command(&mut self, frame: &Frame) -> Result<()> {
        trace!(opcode = %format!("0x{:04X}", frame.opcode), params = ?frame.params, "Sending frame");
        for segment in frame.segments() {
            self.channel.write(&segment)?;
        }
        Ok(())
    }

    /// Receive up to `len` bytes. A short result means the link faulted.
    pub fn receive(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.channel.read(len)?)
    }

    /// Receive exactly `len` bytes of payload or fail with `ProtocolDesync`.
    pub fn read_payload(
        &mut self,
        operation: &'static str,
        address: u32,
        len: usize,
    ) -> Result<Vec<u8>> {
        let data = self.receive(len)?;
        if data.len() != len {
            return Err(Stage2Error::ProtocolDesync {
                operation,
                address,
                expected: len,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Read the 4-byte acknowledgement that follows a state-changing frame.
    pub fn read_ack(&mut self) -> Result<Ack> {
        let bytes = self.receive(ACK_LEN)?;
        let ack = Ack::from_bytes(&bytes);
        debug!(ack = %ack, "Ack received");
        Ok(ack)
    }

    /// Read an acknowledgement and compare it with `expected`.
    pub fn expect_ack(&mut self, expected: &[u8; ACK_LEN]) -> Result<bool> {
        Ok(self.read_ack()?.matches(expected))
    }

    /// Read `count` consecutive 32-bit words, one frame per word.
    pub fn read32(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let mut words = Vec::with_capacity(count);
        for i in 0..count {
            let addr = word_address(address, i)?;
            self.send_command(&Frame::new(CMD_READ_MEM).word(addr).word(4))?;
            let raw = self.read_payload("read32", addr, 4)?;
            words.push(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        }
        Ok(words)
    }

    /// Write consecutive 32-bit words, one acknowledged frame per word.
    pub fn write32(&mut self, address: u32, values: &[u32]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            let addr = word_address(address, i)?;
            let frame = Frame::new(CMD_WRITE_MEM)
                .word(addr)
                .word(4)
                .with_payload(&value.to_le_bytes());
            self.send_command(&frame)?;
            let ack = self.read_ack()?;
            if !ack.is_write_ok() {
                return Err(Stage2Error::WriteRejected {
                    address: addr,
                    length: 4,
                    ack,
                });
            }
        }
        Ok(())
    }
}

fn word_address(base: u32, index: usize) -> Result<u32> {
    u32::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(4))
        .and_then(|off| base.checked_add(off))
        .ok_or_else(|| {
            Stage2Error::BadArgument(format!(
                "word {} past 0x{:08X} overflows the address space",
                index, base
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CMD_MAGIC, ACK_WRITE_OK};
    use crate::transport::MockTransport;

    #[test]
    fn test_read32_word_order() {
        let mock = MockTransport::new();
        mock.poke(0x1000, &[0x78, 0x56, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
        let mut framer = CommandFramer::new(mock);

        let words = framer.read32(0x1000, 2).unwrap();
        assert_eq!(words, vec![0x1234_5678, 0xDEAD_BEEF]);

        let writes = framer.channel().get_writes();
        // magic, opcode, address, length per word
        assert_eq!(writes.len(), 8);
        assert_eq!(writes[0], CMD_MAGIC.to_be_bytes());
        assert_eq!(writes[2], 0x1000u32.to_be_bytes());
        assert_eq!(writes[6], 0x1004u32.to_be_bytes());
    }

    #[test]
    fn test_write32_little_endian_payload() {
        let mock = MockTransport::new();
        let mut framer = CommandFramer::new(mock);

        framer.write32(0x2000, &[0xAABB_CCDD]).unwrap();
        assert_eq!(framer.channel().peek(0x2000, 4), vec![0xDD, 0xCC, 0xBB, 0xAA]);

        let writes = framer.channel().get_writes();
        assert_eq!(writes.last().unwrap(), &vec![0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_write32_rejected() {
        let mock = MockTransport::new();
        mock.reject_writes_at(0x3004);
        let mut framer = CommandFramer::new(mock);

        let err = framer.write32(0x3000, &[1, 2, 3]).unwrap_err();
        match err {
            Stage2Error::WriteRejected { address, .. } => assert_eq!(address, 0x3004),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(framer.channel().peek(0x3000, 4), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_read_payload_desync() {
        let mock = MockTransport::new();
        mock.queue_response(&[1, 2]);
        let mut framer = CommandFramer::new(mock);

        let err = framer.read_payload("probe", 0x40, 4).unwrap_err();
        assert!(matches!(
            err,
            Stage2Error::ProtocolDesync {
                expected: 4,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_expect_ack() {
        let mock = MockTransport::new();
        mock.queue_response(&ACK_WRITE_OK);
        mock.queue_response(&[0xD0, 0xD0, 0xD0, 0x00]);
        let mut framer = CommandFramer::new(mock);

        assert!(framer.expect_ack(&ACK_WRITE_OK).unwrap());
        assert!(!framer.expect_ack(&ACK_WRITE_OK).unwrap());
    }
}
