//! Destinations for bulk reads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Append-only byte destination.
pub trait Sink {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes appended so far.
    fn written(&self) -> u64;

    /// Flush buffered data. Called once at the end of a successful read.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory accumulator.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Sink for MemorySink {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// Buffered appender over any writer, usually a file.
pub struct FileSink<W: Write> {
    writer: BufWriter<W>,
    written: u64,
}

impl FileSink<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> FileSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
            written: 0,
        }
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error().into())
    }
}

impl<W: Write> Sink for FileSink<W> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_accumulates() {
        let mut sink = MemorySink::new();
        sink.append(b"abc").unwrap();
        sink.append(b"de").unwrap();
        assert_eq!(sink.written(), 5);
        assert_eq!(sink.into_inner(), b"abcde");
    }

    #[test]
    fn test_file_sink_counts_and_flushes() {
        let mut sink = FileSink::new(Vec::new());
        sink.append(&[1; 300]).unwrap();
        sink.append(&[2; 5]).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.written(), 305);
        let out = sink.into_inner().unwrap();
        assert_eq!(out.len(), 305);
        assert_eq!(out[300], 2);
    }
}
