//! Sector-paginated bulk reads.
//!
//! A read selects the region once, then issues one frame per sector and
//! takes exactly one sector back. The tail of the last sector is trimmed to
//! the requested length before it reaches the sink. The head of the first
//! sector is only trimmed by the in-memory helpers: sinks always receive
//! data starting at the first sector boundary.

use tracing::{debug, info, instrument};

use super::region::StorageRegion;
use super::sink::{MemorySink, Sink};
use crate::error::{Result, Stage2Error};
use crate::events::{ProgressThrottle, Stage2Event, Stage2Observer, Stage2Phase};
use crate::framer::CommandFramer;
use crate::protocol::{ACK_EMMC_OK, Ack, CMD_INIT_EMMC, CMD_READ_RPMB, CMD_READ_SECTOR, CMD_SELECT_PARTITION, Frame};
use crate::transport::ByteChannel;

pub struct StorageReader<'a, T: ByteChannel> {
    framer: &'a mut CommandFramer<T>,
    observer: &'a dyn Stage2Observer,
}

impl<'a, T: ByteChannel> StorageReader<'a, T> {
    pub fn new(framer: &'a mut CommandFramer<T>, observer: &'a dyn Stage2Observer) -> Self {
        Self { framer, observer }
    }

    /// Bring up the storage controller. Needed once per session.
    pub fn init_emmc(&mut self) -> Result<()> {
        self.framer.send_command(&Frame::new(CMD_INIT_EMMC))?;
        let ack = self.framer.read_ack()?;
        if !ack.is_emmc_ok() {
            return Err(Stage2Error::UnexpectedAck {
                operation: "init_emmc",
                expected: Ack::from_bytes(&ACK_EMMC_OK),
                ack,
            });
        }
        info!("Storage initialised");
        Ok(())
    }

    /// Stream `[offset, offset + length)` of `region` into `sink`, starting
    /// at the sector boundary at or below `offset`. Returns bytes appended.
    pub fn read_region(
        &mut self,
        region: StorageRegion,
        offset: u64,
        length: u64,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        self.read_sectors(region, offset, length, false, sink)
    }

    /// Read exactly `[offset, offset + length)` of `region` into memory.
    pub fn read_region_to_vec(
        &mut self,
        region: StorageRegion,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        self.read_to_vec(region, offset, length, false)
    }

    /// RPMB variant of [`Self::read_region`]. With `reverse` every 256-byte
    /// block is byte-reversed before trimming.
    pub fn read_rpmb(
        &mut self,
        offset: u64,
        length: u64,
        reverse: bool,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        self.read_sectors(StorageRegion::Rpmb, offset, length, reverse, sink)
    }

    pub fn read_rpmb_to_vec(&mut self, offset: u64, length: u64, reverse: bool) -> Result<Vec<u8>> {
        self.read_to_vec(StorageRegion::Rpmb, offset, length, reverse)
    }

    fn read_to_vec(
        &mut self,
        region: StorageRegion,
        offset: u64,
        length: u64,
        reverse: bool,
    ) -> Result<Vec<u8>> {
        let range = region.sector_range(offset, length)?;
        let head = (offset - range.byte_start()) as usize;
        let mut sink = MemorySink::with_capacity(head + length as usize);
        self.read_sectors(region, offset, length, reverse, &mut sink)?;
        let mut data = sink.into_inner();
        data.drain(..head);
        Ok(data)
    }

    #[instrument(level = "debug", skip(self, sink), fields(region = %region))]
    fn read_sectors(
        &mut self,
        region: StorageRegion,
        offset: u64,
        length: u64,
        reverse: bool,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        if length == 0 {
            return Err(Stage2Error::BadArgument(format!(
                "zero-length read of {}",
                region
            )));
        }
        let range = region.sector_range(offset, length)?;
        let sector_size = region.sector_size();
        let end_byte = offset + length;
        let total = range.count();
        let operation = format!("read {}", region);

        debug!(
            start = range.start,
            end = range.end,
            sector_size,
            "Reading sectors"
        );

        self.framer
            .send_command(&Frame::new(CMD_SELECT_PARTITION).word(region.selector()))?;

        let mut throttle = ProgressThrottle::new(total);
        let mut written = 0u64;

        for (done, sector) in (range.start..range.end).enumerate() {
            if self.observer.should_abort() {
                return Err(Stage2Error::Cancelled {
                    operation: "read_region",
                    completed: done as u64,
                    total,
                });
            }

            let frame = match region {
                StorageRegion::Rpmb => Frame::new(CMD_READ_RPMB).half(sector as u16),
                _ => Frame::new(CMD_READ_SECTOR).word(sector),
            };
            self.framer.send_command(&frame)?;

            let mut data = self.framer.receive(sector_size)?;
            if data.len() != sector_size {
                return Err(Stage2Error::ShortRead {
                    operation: "read_region",
                    sector,
                    expected: sector_size,
                    actual: data.len(),
                });
            }
            if reverse {
                data.reverse();
            }

            let sector_start = sector as u64 * sector_size as u64;
            let keep = (end_byte - sector_start).min(sector_size as u64) as usize;
            sink.append(&data[..keep])?;
            written += keep as u64;

            let completed = done as u64 + 1;
            if throttle.advance(completed) {
                self.observer.on_event(&Stage2Event::Progress {
                    phase: Stage2Phase::StorageRead,
                    operation: operation.clone(),
                    current: completed,
                    total,
                });
            }
        }

        sink.finish()?;
        Ok(written)
    }
}
