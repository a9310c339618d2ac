//! Sector-oriented storage access (eMMC boot/user areas and RPMB).

pub mod reader;
pub mod region;
pub mod sink;

pub use reader::StorageReader;
pub use region::{SectorRange, StorageRegion};
pub use sink::{FileSink, MemorySink, Sink};
