//! Chunked arbitrary-address memory access.
//!
//! Reads and writes move at most [`MEM_CHUNK_SIZE`] bytes per frame. Write
//! chunks are zero-padded to the next 4-byte boundary because the agent
//! only accepts word-aligned payload lengths. A failed write is not rolled
//! back.

use std::io::Read;

use tracing::{debug, instrument};

use crate::chip::ChipConfig;
use crate::error::{Result, Stage2Error};
use crate::events::{ProgressThrottle, Stage2Event, Stage2Observer, Stage2Phase};
use crate::framer::CommandFramer;
use crate::protocol::{CMD_READ_MEM, CMD_WRITE_MEM, Frame, MEM_CHUNK_SIZE};
use crate::storage::{MemorySink, Sink};
use crate::transport::ByteChannel;

pub struct MemoryAccessor<'a, T: ByteChannel> {
    framer: &'a mut CommandFramer<T>,
    observer: &'a dyn Stage2Observer,
    chip: &'a ChipConfig,
}

impl<'a, T: ByteChannel> MemoryAccessor<'a, T> {
    pub fn new(
        framer: &'a mut CommandFramer<T>,
        observer: &'a dyn Stage2Observer,
        chip: &'a ChipConfig,
    ) -> Self {
        Self {
            framer,
            observer,
            chip,
        }
    }

    /// Read `length` bytes starting at `address`.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut sink = MemorySink::with_capacity(length);
        self.read_to_sink(address, length as u64, &mut sink)?;
        Ok(sink.into_inner())
    }

    /// Stream `length` bytes starting at `address` into `sink`.
    #[instrument(level = "debug", skip(self, sink), fields(address = %format!("0x{:08X}", address)))]
    pub fn read_to_sink(&mut self, address: u32, length: u64, sink: &mut dyn Sink) -> Result<u64> {
        check_span("read", address, length)?;
        let total = length.div_ceil(MEM_CHUNK_SIZE as u64);
        let mut throttle = ProgressThrottle::new(total);
        let mut pos = 0u64;

        while pos < length {
            self.poll_abort("read_memory", pos, length)?;
            let size = (length - pos).min(MEM_CHUNK_SIZE as u64) as usize;
            let addr = address + pos as u32;
            self.framer
                .send_command(&Frame::new(CMD_READ_MEM).word(addr).word(size as u32))?;
            let data = self.framer.read_payload("read_memory", addr, size)?;
            sink.append(&data)?;
            pos += size as u64;
            self.progress(&mut throttle, "read memory", pos, total);
        }

        sink.finish()?;
        Ok(pos)
    }

    /// Write `data` at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_from_reader(address, &mut &data[..], data.len() as u64)
    }

    /// Write `length` bytes taken from `source` at `address`.
    #[instrument(level = "debug", skip(self, source), fields(address = %format!("0x{:08X}", address)))]
    pub fn write_from_reader(
        &mut self,
        address: u32,
        source: &mut dyn Read,
        length: u64,
    ) -> Result<()> {
        check_span("write", address, length.next_multiple_of(4))?;
        if let Some(range) = self.chip.blacklisted(address, length.next_multiple_of(4)) {
            return Err(Stage2Error::BadArgument(format!(
                "write 0x{:08X}+0x{:X} touches protected range 0x{:08X}+0x{:X}",
                address, length, range.start, range.length
            )));
        }

        let total = length.div_ceil(MEM_CHUNK_SIZE as u64);
        let mut throttle = ProgressThrottle::new(total);
        let mut pos = 0u64;
        let mut chunk = [0u8; MEM_CHUNK_SIZE];

        while pos < length {
            self.poll_abort("write_memory", pos, length)?;
            let size = (length - pos).min(MEM_CHUNK_SIZE as u64) as usize;
            source.read_exact(&mut chunk[..size])?;
            let padded = size.next_multiple_of(4);
            chunk[size..padded].fill(0);

            let addr = address + pos as u32;
            let frame = Frame::new(CMD_WRITE_MEM)
                .word(addr)
                .word(padded as u32)
                .with_payload(&chunk[..padded]);
            self.framer.send_command(&frame)?;

            let ack = self.framer.read_ack()?;
            if !ack.is_write_ok() {
                return Err(Stage2Error::WriteRejected {
                    address: addr,
                    length: padded,
                    ack,
                });
            }
            debug!(address = %format!("0x{:08X}", addr), len = padded, "Chunk written");

            pos += size as u64;
            self.progress(&mut throttle, "write memory", pos, total);
        }
        Ok(())
    }

    fn poll_abort(&self, operation: &'static str, done: u64, length: u64) -> Result<()> {
        if self.observer.should_abort() {
            return Err(Stage2Error::Cancelled {
                operation,
                completed: done / MEM_CHUNK_SIZE as u64,
                total: length.div_ceil(MEM_CHUNK_SIZE as u64),
            });
        }
        Ok(())
    }

    fn progress(&self, throttle: &mut ProgressThrottle, operation: &str, pos: u64, total: u64) {
        let chunks = pos.div_ceil(MEM_CHUNK_SIZE as u64);
        if throttle.advance(chunks) {
            self.observer.on_event(&Stage2Event::Progress {
                phase: Stage2Phase::MemoryAccess,
                operation: operation.to_string(),
                current: chunks,
                total,
            });
        }
    }
}

fn check_span(operation: &str, address: u32, length: u64) -> Result<()> {
    if length == 0 {
        return Err(Stage2Error::BadArgument(format!(
            "zero-length memory {} at 0x{:08X}",
            operation, address
        )));
    }
    if address as u64 + length > u32::MAX as u64 + 1 {
        return Err(Stage2Error::BadArgument(format!(
            "memory {} 0x{:08X}+0x{:X} runs past the 32-bit address space",
            operation, address, length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::AddressRange;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    fn setup() -> (MockTransport, CommandFramer<MockTransport>, ChipConfig) {
        let mock = MockTransport::new();
        (mock.clone(), CommandFramer::new(mock), ChipConfig::generic(0))
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (_mock, mut framer, chip) = setup();
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        for &len in &[1usize, 3, 4, 5, 255, 256, 257, 700, 1023] {
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(1)).collect();
            let addr = 0x4000_0000 + (len as u32) * 0x1000;
            mem.write(addr, &data).unwrap();
            assert_eq!(mem.read(addr, len).unwrap(), data, "len {len}");
        }
    }

    #[test]
    fn test_write_pads_to_word_not_chunk() {
        let (mock, mut framer, chip) = setup();
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        mem.write(0x100, &[0xAA; 0x105]).unwrap();
        let frames: Vec<_> = mock
            .frames()
            .into_iter()
            .filter(|f| f.opcode == CMD_WRITE_MEM)
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].param(0), Some(0x100));
        assert_eq!(frames[0].param(1), Some(0x100));
        assert_eq!(frames[1].param(0), Some(0x200));
        assert_eq!(frames[1].param(1), Some(8));
        assert_eq!(&frames[1].payload[5..], &[0, 0, 0]);
    }

    #[test]
    fn test_read_uses_256_byte_chunks() {
        let (mock, mut framer, chip) = setup();
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        mem.read(0x10, 0x250).unwrap();
        let lens: Vec<u32> = mock
            .frames()
            .iter()
            .filter(|f| f.opcode == CMD_READ_MEM)
            .map(|f| f.param(1).unwrap())
            .collect();
        assert_eq!(lens, vec![0x100, 0x100, 0x50]);
    }

    #[derive(Default)]
    struct ProgressLog {
        seen: std::sync::Mutex<Vec<(Stage2Phase, u64, u64)>>,
    }

    impl Stage2Observer for ProgressLog {
        fn on_event(&self, event: &Stage2Event) {
            if let Stage2Event::Progress {
                phase,
                current,
                total,
                ..
            } = event
            {
                self.seen.lock().unwrap().push((*phase, *current, *total));
            }
        }
    }

    #[test]
    fn test_read_reports_progress_per_chunk() {
        let (_mock, mut framer, chip) = setup();
        let log = ProgressLog::default();
        let mut mem = MemoryAccessor::new(&mut framer, &log, &chip);

        mem.read(0x2000, 0x280).unwrap();
        let seen = log.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Stage2Phase::MemoryAccess, 1, 3),
                (Stage2Phase::MemoryAccess, 2, 3),
                (Stage2Phase::MemoryAccess, 3, 3),
            ]
        );
    }

    #[test]
    fn test_rejected_chunk_stops_write() {
        let (mock, mut framer, chip) = setup();
        mock.reject_writes_at(0x1180);
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        let err = mem.write(0x1000, &[0x11; 0x300]).unwrap_err();
        assert!(matches!(
            err,
            Stage2Error::WriteRejected {
                address: 0x1100,
                length: 0x100,
                ..
            }
        ));
        assert_eq!(mock.frame_count(CMD_WRITE_MEM), 2);
        assert_eq!(mock.peek(0x1000, 1), vec![0x11]);
    }

    #[test]
    fn test_blacklisted_write_rejected_before_io() {
        let mock = MockTransport::new();
        let mut framer = CommandFramer::new(mock.clone());
        let mut chip = ChipConfig::generic(0);
        chip.blacklist.push(AddressRange::new(0x2000, 0x10));
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        assert!(matches!(
            mem.write(0x1FFE, &[0; 3]),
            Err(Stage2Error::BadArgument(_))
        ));
        assert!(mock.get_writes().is_empty());
        mem.write(0x1FF0, &[0; 0x10]).unwrap();
    }

    #[test]
    fn test_span_checks() {
        let (mock, mut framer, chip) = setup();
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        assert!(mem.read(0x10, 0).is_err());
        assert!(mem.read(0xFFFF_FFF0, 0x20).is_err());
        assert!(mem.write(0xFFFF_FFFE, &[1]).is_err());
        assert!(mock.get_writes().is_empty());
        assert_eq!(mem.read(0xFFFF_FFF0, 0x10).unwrap().len(), 0x10);
    }

    #[test]
    fn test_disconnected_link_is_link_error() {
        let mock = MockTransport::new();
        mock.disconnect();
        let mut framer = CommandFramer::new(mock);
        let chip = ChipConfig::generic(0);
        let mut mem = MemoryAccessor::new(&mut framer, &NullObserver, &chip);

        let err = mem.read(0, 4).unwrap_err();
        assert!(err.is_link_fault());
    }
}
