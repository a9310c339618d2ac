//! Stage2-Core: host side of the MediaTek stage2 agent protocol.
//!
//! Once a stage2 agent runs in device SRAM it answers a small framed
//! command set over USB bulk endpoints. This crate drives that command set
//! to dump storage areas, peek and poke memory, derive hardware-bound keys
//! and build security config images.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, acknowledgements, frame layout
//! - **Transport**: Byte channel abstraction (nusb, mock)
//! - **Framer**: The single owner of the channel; one exchange at a time
//! - **Storage**: Sector-paginated reads of boot areas and RPMB
//! - **Memory**: Chunked memory reads and acknowledged writes
//! - **Crypto**: Capability seam for the SoC engines and key extraction
//! - **Boot image**: Preloader layout probing in boot1
//! - **Seccfg**: Sealed security config generation
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use stage2_core::session::{SessionConfig, Stage2Session};
//! use stage2_core::storage::FileSink;
//!
//! let mut session = Stage2Session::new(SessionConfig::default()).expect("no device");
//! session.connect().expect("probe failed");
//! let mut sink = FileSink::create("rpmb.bin").expect("create failed");
//! session.dump_rpmb(None, false, &mut sink).expect("dump failed");
//! ```

pub mod bootimage;
pub mod chip;
pub mod crypto;
pub mod error;
pub mod events;
pub mod framer;
pub mod memory;
pub mod protocol;
pub mod seccfg;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use bootimage::{BootLayout, FlatReason, PreloaderImage, Probe};
pub use chip::{AddressRange, ChipConfig, ChipTable, CryptoEngine};
pub use crypto::{
    CryptoCapability, CryptoError, CryptoOp, CryptoOutput, CryptoRequest, HostCrypto,
    KeyExtractor, KeyMaterial, MockCrypto, RawMode, RegisterBus,
};
pub use error::{Result, Stage2Error};
pub use events::{LogLevel, NullObserver, Stage2Event, Stage2Observer, Stage2Phase, TracingObserver};
pub use framer::CommandFramer;
pub use memory::MemoryAccessor;
pub use protocol::{Ack, Frame, FrameError};
pub use seccfg::{LockFlag, SecCfgBuilder, SecCfgRecord};
pub use session::{PreloaderDump, SessionConfig, Stage2Session};
pub use storage::{FileSink, MemorySink, Sink, StorageReader, StorageRegion};
pub use transport::{ByteChannel, MockTransport, NusbTransport, TransportError};
