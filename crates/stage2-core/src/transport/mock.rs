//! Mock transport emulating the stage2 agent, for testing.
//!
//! Incoming bytes are decoded into frames and answered from a sparse memory
//! map and per-partition storage images, the same way the agent would.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{ByteChannel, TransportError};
use crate::protocol::constants::*;
use crate::protocol::Frame;

const ACK_REJECTED: [u8; 4] = [0xE0, 0xE0, 0xE0, 0xE0];

#[derive(Debug)]
struct AgentState {
    memory: BTreeMap<u32, u8>,
    partitions: HashMap<u32, Vec<u8>>,
    current_partition: u32,
    /// Bytes received but not yet forming a whole frame.
    inbox: Vec<u8>,
    /// Bytes waiting to be read by the host.
    outbox: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    frames: Vec<Frame>,
    rejected_addrs: Vec<u32>,
    short_sectors: HashMap<u32, usize>,
    emmc_ok: bool,
    mute_memory_reads: bool,
    connected: bool,
}

impl AgentState {
    fn handle(&mut self, frame: Frame) {
        let p0 = frame.param(0).unwrap_or(0);
        match frame.opcode {
            CMD_SELECT_PARTITION => self.current_partition = p0,
            CMD_READ_SECTOR => {
                let data = self.sector(self.current_partition, p0, EMMC_SECTOR_SIZE);
                self.outbox.extend(data);
            }
            CMD_READ_RPMB => {
                let data = self.sector(PART_RPMB, p0, RPMB_SECTOR_SIZE);
                self.outbox.extend(data);
            }
            CMD_READ_MEM if self.mute_memory_reads => {}
            CMD_READ_MEM => {
                let len = frame.param(1).unwrap_or(0);
                for i in 0..len {
                    let byte = self.memory.get(&p0.wrapping_add(i)).copied().unwrap_or(0);
                    self.outbox.push_back(byte);
                }
            }
            CMD_WRITE_MEM => {
                let len = frame.payload.len() as u32;
                let rejected = self
                    .rejected_addrs
                    .iter()
                    .any(|&a| a >= p0 && a < p0.wrapping_add(len.max(1)));
                if rejected {
                    self.outbox.extend(ACK_REJECTED);
                } else {
                    for (i, b) in frame.payload.iter().enumerate() {
                        self.memory.insert(p0.wrapping_add(i as u32), *b);
                    }
                    self.outbox.extend(ACK_WRITE_OK);
                }
            }
            CMD_INIT_EMMC => {
                if self.emmc_ok {
                    self.outbox.extend(ACK_EMMC_OK);
                } else {
                    self.outbox.extend([0u8; 4]);
                }
            }
            CMD_REBOOT => self.connected = false,
            _ => {}
        }
        self.frames.push(frame);
    }

    fn sector(&self, partition: u32, index: u32, size: usize) -> Vec<u8> {
        let start = index as usize * size;
        let mut data = vec![0u8; size];
        if let Some(image) = self.partitions.get(&partition)
            && start < image.len()
        {
            let end = (start + size).min(image.len());
            data[..end - start].copy_from_slice(&image[start..end]);
        }
        if let Some(&len) = self.short_sectors.get(&index) {
            data.truncate(len);
        }
        data
    }
}

/// Mock transport for unit testing protocol and session logic.
///
/// Clones share the same emulated agent, so a test can keep a handle after
/// moving the transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<AgentState>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentState {
                memory: BTreeMap::new(),
                partitions: HashMap::new(),
                current_partition: PART_USER,
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                write_log: Vec::new(),
                frames: Vec::new(),
                rejected_addrs: Vec::new(),
                short_sectors: HashMap::new(),
                emmc_ok: true,
                mute_memory_reads: false,
                connected: true,
            })),
            vid: MTK_VENDOR_ID,
            pid: MTK_DA_PID,
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap()
    }

    /// Store bytes in emulated memory.
    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut s = self.state();
        for (i, b) in data.iter().enumerate() {
            s.memory.insert(address.wrapping_add(i as u32), *b);
        }
    }

    /// Read bytes back from emulated memory. Untouched bytes are zero.
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        let s = self.state();
        (0..len as u32)
            .map(|i| s.memory.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect()
    }

    /// Install a storage image for a partition selector (`PART_*`).
    pub fn load_partition(&self, selector: u32, image: Vec<u8>) {
        self.state().partitions.insert(selector, image);
    }

    /// Queue raw bytes to be returned on the next reads.
    pub fn queue_response(&self, data: &[u8]) {
        self.state().outbox.extend(data.iter().copied());
    }

    /// Answer memory writes covering `address` with a failure ack.
    pub fn reject_writes_at(&self, address: u32) {
        self.state().rejected_addrs.push(address);
    }

    /// Truncate the answer for sector `index` (any partition) to `len` bytes.
    pub fn short_sector(&self, index: u32, len: usize) {
        self.state().short_sectors.insert(index, len);
    }

    /// Leave memory reads unanswered.
    pub fn mute_memory_reads(&self) {
        self.state().mute_memory_reads = true;
    }

    /// Make the storage init command fail.
    pub fn fail_emmc_init(&self) {
        self.state().emmc_ok = false;
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state().write_log.clone()
    }

    /// Clear captured writes and decoded frames.
    pub fn clear_writes(&self) {
        let mut s = self.state();
        s.write_log.clear();
        s.frames.clear();
    }

    /// All frames the agent has decoded so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.state().frames.clone()
    }

    /// Number of decoded frames with the given opcode.
    pub fn frame_count(&self, opcode: u32) -> usize {
        self.state()
            .frames
            .iter()
            .filter(|f| f.opcode == opcode)
            .count()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.state().connected = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteChannel for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut s = self.state();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        s.write_log.push(data.to_vec());
        s.inbox.extend_from_slice(data);

        loop {
            match Frame::decode(&s.inbox) {
                Ok(Some((frame, used))) => {
                    s.inbox.drain(..used);
                    s.handle(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    s.inbox.clear();
                    return Err(TransportError::WriteFailed(e.to_string()));
                }
            }
        }
        Ok(data.len())
    }

    fn read(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut s = self.state();
        if !s.connected && s.outbox.is_empty() {
            return Err(TransportError::Disconnected);
        }
        let n = len.min(s.outbox.len());
        Ok(s.outbox.drain(..n).collect())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_memory_write_then_read() {
        let mock = MockTransport::new();
        let frame = Frame::new(CMD_WRITE_MEM)
            .word(0x100)
            .word(4)
            .with_payload(&[9, 8, 7, 6]);
        for seg in frame.segments() {
            mock.write(&seg).unwrap();
        }
        assert_eq!(mock.read(4).unwrap(), ACK_WRITE_OK);
        assert_eq!(mock.peek(0x100, 4), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_mock_frame_split_across_writes() {
        let mock = MockTransport::new();
        mock.load_partition(PART_USER, vec![0x5A; 1024]);
        let bytes = Frame::new(CMD_READ_SECTOR).word(1).to_bytes();
        mock.write(&bytes[..3]).unwrap();
        assert_eq!(mock.frame_count(CMD_READ_SECTOR), 0);
        mock.write(&bytes[3..]).unwrap();
        assert_eq!(mock.frame_count(CMD_READ_SECTOR), 1);
        assert_eq!(mock.read(512).unwrap(), vec![0x5A; 512]);
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(&CMD_MAGIC.to_be_bytes()).unwrap();
        mock.write(&CMD_REBOOT.to_be_bytes()).unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(mock.frame_count(CMD_REBOOT), 1);
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(b"test").is_err());
    }

    #[test]
    fn test_mock_rejects_garbage() {
        let mock = MockTransport::new();
        assert!(mock.write(&[0u8; 8]).is_err());
    }
}
