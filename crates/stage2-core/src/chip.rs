//! Chip configuration table.
//!
//! Everything that differs between SoCs (crypto engine base addresses,
//! protected address ranges, identifier locations) is looked up once by
//! hardware code when the session connects and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Half-open address range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u32,
    pub length: u32,
}

impl AddressRange {
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    /// Whether `[start, start + length)` intersects this range.
    pub fn overlaps(&self, start: u32, length: u64) -> bool {
        let other_end = start as u64 + length;
        length > 0 && self.length > 0 && (start as u64) < self.end() && (self.start as u64) < other_end
    }
}

/// Hardware crypto engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoEngine {
    /// Full-featured engine; derives every named key.
    Dxcc,
    /// Legacy engine; derives the RPMB key only.
    Sej,
}

impl fmt::Display for CryptoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoEngine::Dxcc => write!(f, "dxcc"),
            CryptoEngine::Sej => write!(f, "sej"),
        }
    }
}

/// Per-SoC addresses and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipConfig {
    pub hw_code: u16,
    pub name: String,
    #[serde(default)]
    pub dxcc_base: Option<u32>,
    #[serde(default)]
    pub sej_base: Option<u32>,
    #[serde(default)]
    pub gcpu_base: Option<u32>,
    #[serde(default)]
    pub cqdma_base: Option<u32>,
    /// Ranges that memory writes must never touch.
    #[serde(default)]
    pub blacklist: Vec<AddressRange>,
    #[serde(default)]
    pub meid_addr: Option<u32>,
    #[serde(default)]
    pub socid_addr: Option<u32>,
    #[serde(default)]
    pub prov_addr: Option<u32>,
    #[serde(default)]
    pub payload_addr: Option<u32>,
}

impl ChipConfig {
    /// Configuration for a chip missing from the table: no engines, no
    /// identifier addresses, no blacklist.
    pub fn generic(hw_code: u16) -> Self {
        Self {
            hw_code,
            name: format!("unknown ({:04X})", hw_code),
            dxcc_base: None,
            sej_base: None,
            gcpu_base: None,
            cqdma_base: None,
            blacklist: Vec::new(),
            meid_addr: None,
            socid_addr: None,
            prov_addr: None,
            payload_addr: None,
        }
    }

    /// Engine selected by which base addresses are populated.
    pub fn crypto_engine(&self) -> Option<CryptoEngine> {
        if self.dxcc_base.is_some() {
            Some(CryptoEngine::Dxcc)
        } else if self.sej_base.is_some() {
            Some(CryptoEngine::Sej)
        } else {
            None
        }
    }

    /// First blacklisted range intersecting `[start, start + length)`.
    pub fn blacklisted(&self, start: u32, length: u64) -> Option<&AddressRange> {
        self.blacklist.iter().find(|r| r.overlaps(start, length))
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ChipFile {
    #[serde(default)]
    chip: Vec<ChipConfig>,
}

/// Lookup table from hardware code to [`ChipConfig`].
#[derive(Debug, Clone)]
pub struct ChipTable {
    chips: BTreeMap<u16, ChipConfig>,
}

impl ChipTable {
    /// Table with the built-in entries.
    pub fn builtin() -> Self {
        let mut chips = BTreeMap::new();
        for chip in builtin_chips() {
            chips.insert(chip.hw_code, chip);
        }
        Self { chips }
    }

    /// Add or replace entries from a TOML file with a `[[chip]]` array.
    pub fn extend_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading chip table {}", path.display()))?;
        self.extend_from_toml(&content)
            .with_context(|| format!("parsing chip table {}", path.display()))
    }

    pub fn extend_from_toml(&mut self, content: &str) -> Result<usize> {
        let file: ChipFile = toml::from_str(content)?;
        let count = file.chip.len();
        for chip in file.chip {
            self.chips.insert(chip.hw_code, chip);
        }
        Ok(count)
    }

    pub fn get(&self, hw_code: u16) -> Option<&ChipConfig> {
        self.chips.get(&hw_code)
    }

    /// Entry for `hw_code`, or the generic fallback.
    pub fn resolve(&self, hw_code: u16) -> ChipConfig {
        self.get(hw_code)
            .cloned()
            .unwrap_or_else(|| ChipConfig::generic(hw_code))
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }
}

impl Default for ChipTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_chips() -> Vec<ChipConfig> {
    vec![
        ChipConfig {
            hw_code: 0x0321,
            name: "MT6735".into(),
            dxcc_base: None,
            sej_base: Some(0x1000_A000),
            gcpu_base: Some(0x1021_0000),
            cqdma_base: Some(0x1021_7C00),
            blacklist: vec![AddressRange::new(0x0010_2788, 0x100)],
            meid_addr: Some(0x0010_2AF8),
            socid_addr: None,
            prov_addr: None,
            payload_addr: Some(0x0010_0A00),
        },
        ChipConfig {
            hw_code: 0x6580,
            name: "MT6580".into(),
            dxcc_base: None,
            sej_base: Some(0x1000_A000),
            gcpu_base: None,
            cqdma_base: None,
            blacklist: vec![AddressRange::new(0x0010_2764, 0x100)],
            meid_addr: Some(0x0010_2AB4),
            socid_addr: None,
            prov_addr: None,
            payload_addr: Some(0x0010_0A00),
        },
        ChipConfig {
            hw_code: 0x0766,
            name: "MT6765".into(),
            dxcc_base: Some(0x1021_0000),
            sej_base: Some(0x1000_A000),
            gcpu_base: Some(0x1005_0000),
            cqdma_base: Some(0x1021_2000),
            blacklist: vec![
                AddressRange::new(0x0010_2828, 0x100),
                AddressRange::new(0x0010_5BF0, 0x100),
            ],
            meid_addr: Some(0x0010_2AF8),
            socid_addr: Some(0x0010_2B08),
            prov_addr: Some(0x0010_54F4),
            payload_addr: Some(0x0010_0A00),
        },
        ChipConfig {
            hw_code: 0x0788,
            name: "MT6771".into(),
            dxcc_base: Some(0x1021_0000),
            sej_base: Some(0x1000_A000),
            gcpu_base: None,
            cqdma_base: Some(0x1021_2000),
            blacklist: vec![
                AddressRange::new(0x0010_2834, 0x100),
                AddressRange::new(0x0010_6A60, 0x100),
            ],
            meid_addr: Some(0x0010_2B38),
            socid_addr: Some(0x0010_2B48),
            prov_addr: Some(0x0010_65A4),
            payload_addr: Some(0x0010_0A00),
        },
        ChipConfig {
            hw_code: 0x0813,
            name: "MT6785".into(),
            dxcc_base: Some(0x1021_0000),
            sej_base: Some(0x1000_A000),
            gcpu_base: None,
            cqdma_base: Some(0x1021_2000),
            blacklist: vec![
                AddressRange::new(0x0010_2838, 0x100),
                AddressRange::new(0x0010_6A60, 0x100),
            ],
            meid_addr: Some(0x0010_2B78),
            socid_addr: Some(0x0010_2B88),
            prov_addr: Some(0x0010_65A4),
            payload_addr: Some(0x0010_0A00),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_selection() {
        let table = ChipTable::builtin();
        assert_eq!(
            table.resolve(0x0766).crypto_engine(),
            Some(CryptoEngine::Dxcc)
        );
        assert_eq!(
            table.resolve(0x6580).crypto_engine(),
            Some(CryptoEngine::Sej)
        );
        assert_eq!(table.resolve(0xBEEF).crypto_engine(), None);
    }

    #[test]
    fn test_unknown_chip_is_generic() {
        let chip = ChipTable::builtin().resolve(0x1234);
        assert_eq!(chip, ChipConfig::generic(0x1234));
        assert!(chip.blacklist.is_empty());
    }

    #[test]
    fn test_overlap() {
        let r = AddressRange::new(0x1000, 0x100);
        assert!(r.overlaps(0x10FF, 1));
        assert!(r.overlaps(0x0F00, 0x101));
        assert!(!r.overlaps(0x1100, 4));
        assert!(!r.overlaps(0x0F00, 0x100));
        assert!(!r.overlaps(0x1000, 0));
    }

    #[test]
    fn test_extend_from_toml_overrides() {
        let mut table = ChipTable::builtin();
        let before = table.len();
        let added = table
            .extend_from_toml(
                r#"
                [[chip]]
                hw_code = 0x0766
                name = "MT6765-custom"
                sej_base = 0x1000A000

                [[chip]]
                hw_code = 0x0999
                name = "Test"
                blacklist = [{ start = 0x200, length = 0x10 }]
                "#,
            )
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(table.len(), before + 1);

        let custom = table.resolve(0x0766);
        assert_eq!(custom.name, "MT6765-custom");
        assert_eq!(custom.crypto_engine(), Some(CryptoEngine::Sej));
        assert!(table.resolve(0x0999).blacklisted(0x20C, 8).is_some());
    }
}
