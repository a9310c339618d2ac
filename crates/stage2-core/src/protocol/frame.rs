//! Command frame encoding and decoding.
//!
//! A frame is the sentinel, an opcode and a fixed, opcode-specific list of
//! parameters, optionally followed by a data payload. Header fields travel
//! big-endian. Data words (memory contents) travel little-endian and are
//! carried opaquely in the payload.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("Unknown opcode 0x{0:04X}")]
    UnknownOpcode(u32),
}

/// A single frame parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// 32-bit big-endian word (address, length, sector, selector).
    Word(u32),
    /// 16-bit big-endian value (RPMB sector index).
    Half(u16),
}

impl Param {
    pub fn len(&self) -> usize {
        match self {
            Param::Word(_) => 4,
            Param::Half(_) => 2,
        }
    }

    pub fn value(&self) -> u32 {
        match self {
            Param::Word(v) => *v,
            Param::Half(v) => *v as u32,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        match self {
            Param::Word(v) => buf.write_u32::<BigEndian>(*v).unwrap(),
            Param::Half(v) => buf.write_u16::<BigEndian>(*v).unwrap(),
        }
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Word,
    Half,
}

/// Parameter layout of each opcode, and the index of the parameter that
/// gives the payload length when the opcode carries one.
fn layout(opcode: u32) -> Option<(&'static [ParamKind], Option<usize>)> {
    use ParamKind::*;
    match opcode {
        CMD_READ_SECTOR => Some((&[Word], None)),
        CMD_SELECT_PARTITION => Some((&[Word], None)),
        CMD_READ_RPMB => Some((&[Half], None)),
        CMD_REBOOT => Some((&[], None)),
        CMD_WRITE_MEM => Some((&[Word, Word], Some(1))),
        CMD_READ_MEM => Some((&[Word, Word], None)),
        CMD_INIT_EMMC => Some((&[], None)),
        _ => None,
    }
}

/// Command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u32,
    pub params: Vec<Param>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u32) -> Self {
        Self {
            opcode,
            params: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn word(mut self, value: u32) -> Self {
        self.params.push(Param::Word(value));
        self
    }

    #[must_use]
    pub fn half(mut self, value: u16) -> Self {
        self.params.push(Param::Half(value));
        self
    }

    #[must_use]
    pub fn with_payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Parameter value at `index`, if present.
    pub fn param(&self, index: usize) -> Option<u32> {
        self.params.get(index).map(Param::value)
    }

    /// The frame as the sequence of bulk transfers the agent expects:
    /// sentinel, opcode, each parameter, then the payload if any.
    pub fn segments(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(self.params.len() + 3);
        out.push(CMD_MAGIC.to_be_bytes().to_vec());
        out.push(self.opcode.to_be_bytes().to_vec());
        out.extend(self.params.iter().map(Param::to_bytes));
        if !self.payload.is_empty() {
            out.push(self.payload.clone());
        }
        out
    }

    /// Contiguous wire image of the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.segments().concat()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame,
    /// otherwise the frame and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u32::<BigEndian>().unwrap_or_default();
        if magic != CMD_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: CMD_MAGIC,
                actual: magic,
            });
        }
        let opcode = cursor.read_u32::<BigEndian>().unwrap_or_default();
        let (kinds, payload_len_idx) = layout(opcode).ok_or(FrameError::UnknownOpcode(opcode))?;

        let mut frame = Frame::new(opcode);
        for kind in kinds {
            let param = match kind {
                ParamKind::Word => cursor.read_u32::<BigEndian>().map(Param::Word),
                ParamKind::Half => cursor.read_u16::<BigEndian>().map(Param::Half),
            };
            match param {
                Ok(p) => frame.params.push(p),
                Err(_) => return Ok(None),
            }
        }

        let mut consumed = cursor.position() as usize;
        if let Some(idx) = payload_len_idx {
            let len = frame.param(idx).unwrap_or(0) as usize;
            if buf.len() < consumed + len {
                return Ok(None);
            }
            frame.payload = buf[consumed..consumed + len].to_vec();
            consumed += len;
        }
        Ok(Some((frame, consumed)))
    }
}
