//! Preloader location inside the boot1 area.
//!
//! Layout of a structured boot area:
//!
//! ```text
//! 0x00          "EMMC_BOOT"
//! 0x10          u32 LE -> layout table (L)
//! L + 0x00      "BRLYT"
//! L + 0x0C      u32 LE -> payload start (S)
//! S + 0x00      "MMM\x01"
//! S + 0x20      u32 LE payload length
//! ```
//!
//! The payload may embed a `MTK_BLOADER_INFO` block whose name field gives
//! the preloader's file name.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

pub const BOOT_SIGNATURE: &[u8] = b"EMMC_BOOT";
pub const LAYOUT_SIGNATURE: &[u8] = b"BRLYT";
pub const PAYLOAD_TAG: &[u8] = b"MMM\x01";
pub const BLOADER_INFO_MARKER: &[u8] = b"MTK_BLOADER_INFO";

pub const LAYOUT_PTR_OFFSET: usize = 0x10;
pub const LAYOUT_START_OFFSET: usize = 0x0C;
pub const PAYLOAD_LENGTH_OFFSET: usize = 0x20;
pub const NAME_OFFSET: usize = 0x1B;
pub const NAME_LEN: usize = 0x3D;

pub const HEADER_PREFIX: &str = "hdr_";

/// Payload placement found by [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootLayout {
    pub payload_offset: usize,
    pub payload_length: usize,
}

impl BootLayout {
    /// Bytes that must be read from offset 0 to cover header and payload.
    pub fn total_len(&self) -> usize {
        self.payload_offset + self.payload_length
    }

    /// Split a re-read of `[0, total_len)` into header and payload.
    ///
    /// `data` may be shorter than expected; the mismatch is recorded and the
    /// slices are clipped to what is there.
    pub fn extract(&self, data: &[u8], default_name: &str) -> PreloaderImage {
        let expected = self.total_len();
        let length_mismatch = (data.len() != expected).then_some((expected, data.len()));

        let name = find_image_name(data).unwrap_or_else(|| default_name.to_string());
        let header_end = self.payload_offset.min(data.len());
        let payload_end = expected.min(data.len());

        PreloaderImage {
            header_name: format!("{}{}", HEADER_PREFIX, name),
            name,
            header: data[..header_end].to_vec(),
            payload: data[header_end..payload_end].to_vec(),
            payload_offset: self.payload_offset,
            length_mismatch,
        }
    }
}

/// Why a boot area is treated as unstructured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatReason {
    NoBootSignature,
    BadLayoutSignature { offset: usize },
    BadPayloadTag { offset: usize },
    Truncated { needed: usize, have: usize },
}

impl fmt::Display for FlatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatReason::NoBootSignature => write!(f, "no EMMC_BOOT signature"),
            FlatReason::BadLayoutSignature { offset } => {
                write!(f, "no BRLYT signature at 0x{:X}", offset)
            }
            FlatReason::BadPayloadTag { offset } => {
                write!(f, "no payload tag at 0x{:X}", offset)
            }
            FlatReason::Truncated { needed, have } => {
                write!(f, "probe too short: need 0x{:X} bytes, have 0x{:X}", needed, have)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Structured(BootLayout),
    /// Dump a fixed length without parsing.
    Flat(FlatReason),
}

/// Preloader split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloaderImage {
    pub name: String,
    pub header_name: String,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub payload_offset: usize,
    /// `(expected, actual)` when the re-read came back with another size.
    pub length_mismatch: Option<(usize, usize)>,
}

fn read_u32_at(buf: &[u8], offset: usize) -> Result<u32, FlatReason> {
    if offset + 4 > buf.len() {
        return Err(FlatReason::Truncated {
            needed: offset + 4,
            have: buf.len(),
        });
    }
    let mut cursor = Cursor::new(&buf[offset..offset + 4]);
    cursor.read_u32::<LittleEndian>().map_err(|_| FlatReason::Truncated {
        needed: offset + 4,
        have: buf.len(),
    })
}

fn has_at(buf: &[u8], offset: usize, sig: &[u8]) -> bool {
    buf.get(offset..offset + sig.len()) == Some(sig)
}

/// Locate the preloader inside a probe of the boot1 area.
pub fn probe(buf: &[u8]) -> Probe {
    match probe_layout(buf) {
        Ok(layout) => Probe::Structured(layout),
        Err(reason) => Probe::Flat(reason),
    }
}

fn probe_layout(buf: &[u8]) -> Result<BootLayout, FlatReason> {
    if !has_at(buf, 0, BOOT_SIGNATURE) {
        return Err(FlatReason::NoBootSignature);
    }

    let layout = read_u32_at(buf, LAYOUT_PTR_OFFSET)? as usize;
    if !has_at(buf, layout, LAYOUT_SIGNATURE) {
        return Err(FlatReason::BadLayoutSignature { offset: layout });
    }

    let start = read_u32_at(buf, layout + LAYOUT_START_OFFSET)? as usize;
    if !has_at(buf, start, PAYLOAD_TAG) {
        return Err(FlatReason::BadPayloadTag { offset: start });
    }

    let length = read_u32_at(buf, start + PAYLOAD_LENGTH_OFFSET)? as usize;
    Ok(BootLayout {
        payload_offset: start,
        payload_length: length,
    })
}

/// Name from an embedded `MTK_BLOADER_INFO` block, if any.
///
/// The text comes from the device and ends up as a file name, so anything
/// that is not a plain single path component is discarded.
pub fn find_image_name(data: &[u8]) -> Option<String> {
    let idx = data
        .windows(BLOADER_INFO_MARKER.len())
        .position(|w| w == BLOADER_INFO_MARKER)?;
    let start = idx + NAME_OFFSET;
    let end = (start + NAME_LEN).min(data.len());
    if start >= end {
        return None;
    }
    let raw = &data[start..end];
    let trimmed = match raw.iter().rposition(|&b| b != 0) {
        Some(last) => &raw[..=last],
        None => return None,
    };
    plain_file_name(&String::from_utf8_lossy(trimmed))
}

fn plain_file_name(text: &str) -> Option<String> {
    if text.is_empty() || text == "." || text == ".." {
        return None;
    }
    if text.contains(['/', '\\', '\0']) {
        return None;
    }
    match Path::new(text).file_name() {
        Some(name) if name == text => Some(text.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: usize = 0x200;
    const START: usize = 0x800;

    fn synthetic(payload: &[u8], name: Option<&str>) -> Vec<u8> {
        let mut buf = vec![0u8; START + payload.len()];
        buf[..9].copy_from_slice(BOOT_SIGNATURE);
        buf[LAYOUT_PTR_OFFSET..LAYOUT_PTR_OFFSET + 4].copy_from_slice(&(LAYOUT as u32).to_le_bytes());
        buf[LAYOUT..LAYOUT + 5].copy_from_slice(LAYOUT_SIGNATURE);
        buf[LAYOUT + 0xC..LAYOUT + 0x10].copy_from_slice(&(START as u32).to_le_bytes());
        buf[START..].copy_from_slice(payload);
        buf[START..START + 4].copy_from_slice(PAYLOAD_TAG);
        buf[START + 0x20..START + 0x24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        if let Some(name) = name {
            let m = START + 0x100;
            buf[m..m + BLOADER_INFO_MARKER.len()].copy_from_slice(BLOADER_INFO_MARKER);
            buf[m + NAME_OFFSET..m + NAME_OFFSET + NAME_LEN].fill(0);
            buf[m + NAME_OFFSET..m + NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        }
        buf
    }

    #[test]
    fn test_structured_with_embedded_name() {
        let payload: Vec<u8> = (0..0x1000u32).map(|i| (i % 251) as u8).collect();
        let buf = synthetic(&payload, Some("foo.img"));

        let layout = match probe(&buf) {
            Probe::Structured(l) => l,
            Probe::Flat(r) => panic!("unexpected flat: {r}"),
        };
        assert_eq!(layout.payload_offset, START);
        assert_eq!(layout.payload_length, payload.len());

        let image = layout.extract(&buf, "preloader.bin");
        assert_eq!(image.name, "foo.img");
        assert_eq!(image.header_name, "hdr_foo.img");
        assert_eq!(image.payload, &buf[START..START + payload.len()]);
        assert_eq!(image.header, &buf[..START]);
        assert_eq!(image.length_mismatch, None);
    }

    #[test]
    fn test_embedded_name_cannot_leave_output_dir() {
        let payload = vec![0x33u8; 0x400];
        for hostile in ["/tmp/owned.bin", "../../etc/passwd", "..", ".", "a\\b.bin", "a\0b"] {
            let buf = synthetic(&payload, Some(hostile));
            let Probe::Structured(layout) = probe(&buf) else {
                panic!("expected structured layout");
            };
            let image = layout.extract(&buf, "preloader.bin");
            assert_eq!(image.name, "preloader.bin", "name {hostile:?} was kept");
            assert_eq!(image.header_name, "hdr_preloader.bin");
        }
    }

    #[test]
    fn test_default_name_without_marker() {
        let buf = synthetic(&[0x11; 0x300], None);
        let Probe::Structured(layout) = probe(&buf) else {
            panic!("expected structured layout");
        };
        let image = layout.extract(&buf, "preloader.bin");
        assert_eq!(image.name, "preloader.bin");
        assert_eq!(image.header_name, "hdr_preloader.bin");
    }

    #[test]
    fn test_missing_signature_is_flat() {
        let buf = vec![0xFFu8; 0x4000];
        assert_eq!(probe(&buf), Probe::Flat(FlatReason::NoBootSignature));
    }

    #[test]
    fn test_bad_layout_pointer_is_flat() {
        let mut buf = synthetic(&[0; 0x100], None);
        buf[LAYOUT] = b'X';
        assert_eq!(
            probe(&buf),
            Probe::Flat(FlatReason::BadLayoutSignature { offset: LAYOUT })
        );

        let mut buf = synthetic(&[0; 0x100], None);
        buf[LAYOUT_PTR_OFFSET..LAYOUT_PTR_OFFSET + 4].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
        assert!(matches!(probe(&buf), Probe::Flat(FlatReason::BadLayoutSignature { .. })));
    }

    #[test]
    fn test_short_reread_is_recorded_not_fatal() {
        let buf = synthetic(&[0x22; 0x400], Some("pl.bin"));
        let Probe::Structured(layout) = probe(&buf) else {
            panic!("expected structured layout");
        };
        let image = layout.extract(&buf[..START + 0x200], "x");
        assert_eq!(image.length_mismatch, Some((START + 0x400, START + 0x200)));
        assert_eq!(image.payload.len(), 0x200);
    }

    #[test]
    fn test_name_trailing_zeros_trimmed() {
        let mut data = vec![0u8; 0x80];
        data[4..4 + 16].copy_from_slice(BLOADER_INFO_MARKER);
        data[4 + NAME_OFFSET..4 + NAME_OFFSET + 5].copy_from_slice(b"a.bin");
        assert_eq!(find_image_name(&data).as_deref(), Some("a.bin"));
    }
}
