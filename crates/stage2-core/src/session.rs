//! Stage2 session: owns the link and exposes the user-level operations.
//!
//! Every component that talks to the agent borrows the session's framer for
//! the duration of one call, so at most one exchange is ever in flight.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::bootimage::{self, Probe};
use crate::chip::{ChipConfig, ChipTable};
use crate::crypto::{CryptoCapability, HostCrypto, KeyExtractor, KeyMaterial, RawMode};
use crate::error::{Result, Stage2Error};
use crate::events::{
    LogLevel, PacketDirection, Stage2Event, Stage2Observer, Stage2Phase, TracingObserver,
};
use crate::framer::CommandFramer;
use crate::memory::MemoryAccessor;
use crate::protocol::constants::*;
use crate::protocol::Frame;
use crate::seccfg::{LockFlag, SecCfgBuilder};
use crate::storage::{MemorySink, Sink, StorageReader, StorageRegion};
use crate::transport::{ByteChannel, NusbTransport, TransportError};

pub const DEFAULT_PRELOADER_NAME: &str = "preloader.bin";
pub const MEID_LEN: usize = 16;
pub const SOCID_LEN: usize = 32;

/// Configuration for a stage2 session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID override.
    pub vid: Option<u16>,
    /// USB product ID override. Only used together with `vid`.
    pub pid: Option<u16>,
    /// Extra `[[chip]]` entries merged over the built-in table.
    pub chip_table_path: Option<String>,
    /// Bytes dumped from RPMB when the caller gives no length.
    pub rpmb_size: u64,
    /// Where the CLI writes artifacts.
    pub output_dir: String,
    /// Bytes of boot1 read to locate the preloader.
    pub preloader_probe_size: usize,
    /// Bytes of boot1 dumped when no layout is found.
    pub preloader_fallback_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vid: None,
            pid: None,
            chip_table_path: None,
            rpmb_size: DEFAULT_RPMB_SIZE,
            output_dir: ".".to_string(),
            preloader_probe_size: PRELOADER_PROBE_SIZE,
            preloader_fallback_size: PRELOADER_FLAT_SIZE,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Built-in chip table plus the configured overrides.
    pub fn chip_table(&self) -> anyhow::Result<ChipTable> {
        let mut table = ChipTable::builtin();
        if let Some(path) = &self.chip_table_path {
            let added = table.extend_from_file(path)?;
            info!(path = %path, entries = added, "Loaded chip table");
        }
        Ok(table)
    }
}

/// Result of [`Stage2Session::dump_preloader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloaderDump {
    Structured {
        name: String,
        header_name: String,
        header: Vec<u8>,
        payload: Vec<u8>,
    },
    /// No recognisable layout; a fixed-size raw dump of boot1.
    Flat { data: Vec<u8> },
}

#[derive(Debug)]
struct SessionState {
    phase: Stage2Phase,
    connected: bool,
    /// Set once the hardware code has been read.
    hw_code: Option<u16>,
    chip: ChipConfig,
    emmc_initialized: bool,
}

/// Stage2 session over a byte channel.
pub struct Stage2Session<T: ByteChannel, O: Stage2Observer> {
    config: SessionConfig,
    observer: Arc<O>,
    framer: CommandFramer<ObservableTransport<T, O>>,
    crypto: Arc<dyn CryptoCapability>,
    chips: ChipTable,
    state: SessionState,
}

impl Stage2Session<NusbTransport, TracingObserver> {
    /// Open the first matching USB device with the default tracing observer.
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        Self::open(config, Arc::new(TracingObserver))
    }
}

impl<O: Stage2Observer + 'static> Stage2Session<NusbTransport, O> {
    /// Open a USB device and wrap it in a session. The crypto capability
    /// defaults to [`HostCrypto`]; see [`Stage2Session::with_crypto`].
    pub fn open(config: SessionConfig, observer: Arc<O>) -> anyhow::Result<Self> {
        let transport = match (config.vid, config.pid) {
            (Some(vid), Some(pid)) => NusbTransport::open_with_ids(vid, pid)?,
            _ => NusbTransport::open()?,
        };
        Self::with_transport(transport, config, observer, Arc::new(HostCrypto))
    }
}

impl<T: ByteChannel, O: Stage2Observer + 'static> Stage2Session<T, O> {
    /// Build a session over an already-open channel.
    pub fn with_transport(
        transport: T,
        config: SessionConfig,
        observer: Arc<O>,
        crypto: Arc<dyn CryptoCapability>,
    ) -> anyhow::Result<Self> {
        let chips = config.chip_table()?;
        let connected = transport.is_connected();
        let framer = CommandFramer::new(ObservableTransport::new(transport, observer.clone()));
        Ok(Self {
            config,
            observer,
            framer,
            crypto,
            chips,
            state: SessionState {
                phase: Stage2Phase::Disconnected,
                connected,
                hw_code: None,
                chip: ChipConfig::generic(0),
                emmc_initialized: false,
            },
        })
    }

    /// Replace the crypto capability.
    #[must_use]
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoCapability>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Stage2Phase {
        self.state.phase
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected && self.framer.channel().is_connected()
    }

    pub fn hw_code(&self) -> Option<u16> {
        self.state.hw_code
    }

    /// Active chip configuration. Generic until [`Self::connect`] ran.
    pub fn chip(&self) -> &ChipConfig {
        &self.state.chip
    }

    /// Read the hardware code and resolve the chip configuration.
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<&ChipConfig> {
        self.ensure_connected()?;
        let channel = self.framer.channel();
        self.observer.on_event(&Stage2Event::DeviceConnected {
            vid: channel.vendor_id(),
            pid: channel.product_id(),
        });
        self.set_phase(Stage2Phase::Probe);

        let result = self.framer.read32(HW_CODE_ADDR, 1);
        let word = self.finish("connect", result)?[0];
        let hw_code = (word & 0xFFFF) as u16;

        let chip = match self.chips.get(hw_code) {
            Some(chip) => chip.clone(),
            None => {
                let message = format!(
                    "Unknown hardware code 0x{:04X}, using generic configuration",
                    hw_code
                );
                warn!(hw_code = %format!("0x{:04X}", hw_code), "Unknown chip");
                self.log(LogLevel::Warn, message);
                ChipConfig::generic(hw_code)
            }
        };
        info!(hw_code = %format!("0x{:04X}", hw_code), chip = %chip.name, "Chip identified");

        self.state.hw_code = Some(hw_code);
        self.state.chip = chip;
        self.set_phase(Stage2Phase::Ready);
        Ok(&self.state.chip)
    }

    /// Dump the preloader from boot1, split into header and payload when the
    /// boot area carries a layout table.
    #[instrument(skip(self))]
    pub fn dump_preloader(&mut self) -> Result<PreloaderDump> {
        self.begin(Stage2Phase::StorageRead)?;
        let result = self.read_preloader();
        self.finish("dump_preloader", result)
    }

    /// Read `length` bytes from the start of boot2.
    #[instrument(skip(self))]
    pub fn dump_boot2(&mut self, length: u64) -> Result<Vec<u8>> {
        self.begin(Stage2Phase::StorageRead)?;
        let result = self.ensure_emmc().and_then(|_| {
            StorageReader::new(&mut self.framer, self.observer.as_ref())
                .read_region_to_vec(StorageRegion::Boot2, 0, length)
        });
        self.finish("dump_boot2", result)
    }

    /// Stream the RPMB area into `sink`. `None` uses the configured size.
    #[instrument(skip(self, sink))]
    pub fn dump_rpmb(
        &mut self,
        length: Option<u64>,
        reverse: bool,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        let length = length.unwrap_or(self.config.rpmb_size);
        self.begin(Stage2Phase::StorageRead)?;
        let result = self.ensure_emmc().and_then(|_| {
            StorageReader::new(&mut self.framer, self.observer.as_ref())
                .read_rpmb(0, length, reverse, sink)
        });
        self.finish("dump_rpmb", result)
    }

    /// Stream an arbitrary range of a storage region into `sink`.
    #[instrument(skip(self, sink))]
    pub fn dump_region(
        &mut self,
        region: StorageRegion,
        offset: u64,
        length: u64,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        self.begin(Stage2Phase::StorageRead)?;
        let result = self.ensure_emmc().and_then(|_| {
            StorageReader::new(&mut self.framer, self.observer.as_ref())
                .read_region(region, offset, length, sink)
        });
        self.finish("dump_region", result)
    }

    #[instrument(skip(self), fields(address = %format!("0x{:08X}", address)))]
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.begin(Stage2Phase::MemoryAccess)?;
        let result =
            MemoryAccessor::new(&mut self.framer, self.observer.as_ref(), &self.state.chip)
                .read(address, length);
        self.finish("read_memory", result)
    }

    #[instrument(skip(self, sink), fields(address = %format!("0x{:08X}", address)))]
    pub fn read_memory_to(
        &mut self,
        address: u32,
        length: u64,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        self.begin(Stage2Phase::MemoryAccess)?;
        let result =
            MemoryAccessor::new(&mut self.framer, self.observer.as_ref(), &self.state.chip)
                .read_to_sink(address, length, sink);
        self.finish("read_memory", result)
    }

    #[instrument(skip(self, data), fields(address = %format!("0x{:08X}", address), len = data.len()))]
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.begin(Stage2Phase::MemoryAccess)?;
        let result =
            MemoryAccessor::new(&mut self.framer, self.observer.as_ref(), &self.state.chip)
                .write(address, data);
        self.finish("write_memory", result)
    }

    #[instrument(skip(self, source), fields(address = %format!("0x{:08X}", address)))]
    pub fn write_memory_from(
        &mut self,
        address: u32,
        source: &mut dyn Read,
        length: u64,
    ) -> Result<()> {
        self.begin(Stage2Phase::MemoryAccess)?;
        let result =
            MemoryAccessor::new(&mut self.framer, self.observer.as_ref(), &self.state.chip)
                .write_from_reader(address, source, length);
        self.finish("write_memory", result)
    }

    /// Derive every key the chip's engine supports, plus the device
    /// identifiers when their addresses are known.
    #[instrument(skip(self, seed, otp))]
    pub fn extract_keys(&mut self, seed: &[u8], otp: Option<&[u8]>) -> Result<KeyMaterial> {
        self.begin(Stage2Phase::Crypto)?;
        let result = self.collect_keys(seed, otp);
        self.finish("extract_keys", result)
    }

    /// Run one engine operation directly.
    #[instrument(skip(self, data), fields(mode = %mode, len = data.len()))]
    pub fn crypto_passthrough(&mut self, mode: RawMode, data: &[u8]) -> Result<Vec<u8>> {
        self.begin(Stage2Phase::Crypto)?;
        let result = KeyExtractor::new(self.crypto.as_ref(), &self.state.chip).raw_operation(
            &mut self.framer,
            mode,
            data,
            None,
        );
        self.finish("crypto_passthrough", result)
    }

    /// Build a sealed 512-byte security config image for `flag`
    /// (`unlock` or `lock`).
    #[instrument(skip(self))]
    pub fn generate_seccfg(&mut self, flag: &str, use_software: bool) -> Result<Vec<u8>> {
        let flag: LockFlag = flag.parse()?;
        self.begin(Stage2Phase::Crypto)?;
        let result =
            SecCfgBuilder::new(self.crypto.as_ref()).build(&mut self.framer, flag, use_software);
        self.finish("generate_seccfg", result)
    }

    /// Ask the agent to reboot the device. No answer is expected and the
    /// link is unusable afterwards.
    #[instrument(skip(self))]
    pub fn reboot(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.set_phase(Stage2Phase::Rebooting);
        let result = self.framer.send_command(&Frame::new(CMD_REBOOT));
        self.state.connected = false;
        self.state.emmc_initialized = false;
        self.set_phase(Stage2Phase::Disconnected);
        result?;
        info!("Reboot requested");
        self.observer.on_event(&Stage2Event::Complete {
            operation: "reboot".to_string(),
        });
        Ok(())
    }

    fn read_preloader(&mut self) -> Result<PreloaderDump> {
        self.ensure_emmc()?;
        let probe_size = self.config.preloader_probe_size as u64;
        let mut reader = StorageReader::new(&mut self.framer, self.observer.as_ref());
        let head = reader.read_region_to_vec(StorageRegion::Boot1, 0, probe_size)?;

        match bootimage::probe(&head) {
            Probe::Structured(layout) => {
                info!(
                    offset = %format!("0x{:X}", layout.payload_offset),
                    length = %format!("0x{:X}", layout.payload_length),
                    "Preloader layout found"
                );
                let mut sink = MemorySink::with_capacity(layout.total_len());
                match reader.read_region(
                    StorageRegion::Boot1,
                    0,
                    layout.total_len() as u64,
                    &mut sink,
                ) {
                    Ok(_) => {}
                    // Keep the sectors read so far; the split below reports the shortfall.
                    Err(Stage2Error::ShortRead { sector, .. }) => {
                        warn!(sector, "Preloader re-read cut short");
                    }
                    Err(e) => return Err(e),
                }
                let data = sink.into_inner();
                let image = layout.extract(&data, DEFAULT_PRELOADER_NAME);
                if let Some((expected, actual)) = image.length_mismatch {
                    warn!(expected, actual, "Preloader length mismatch");
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "Preloader length mismatch: expected 0x{:X} bytes, got 0x{:X}",
                            expected, actual
                        ),
                    );
                }
                Ok(PreloaderDump::Structured {
                    name: image.name,
                    header_name: image.header_name,
                    header: image.header,
                    payload: image.payload,
                })
            }
            Probe::Flat(reason) => {
                info!(reason = %reason, "No preloader layout, dumping raw boot1");
                let size = self.config.preloader_fallback_size as u64;
                let data = reader.read_region_to_vec(StorageRegion::Boot1, 0, size)?;
                Ok(PreloaderDump::Flat { data })
            }
        }
    }

    fn collect_keys(&mut self, seed: &[u8], otp: Option<&[u8]>) -> Result<KeyMaterial> {
        let chip = &self.state.chip;
        let mut keys = KeyExtractor::new(self.crypto.as_ref(), chip).extract(
            &mut self.framer,
            seed,
            otp,
        )?;

        let mut memory = MemoryAccessor::new(&mut self.framer, self.observer.as_ref(), chip);
        if let Some(addr) = chip.meid_addr {
            keys.meid = Some(memory.read(addr, MEID_LEN)?);
        }
        if let Some(addr) = chip.socid_addr {
            keys.socid = Some(memory.read(addr, SOCID_LEN)?);
        }
        Ok(keys)
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.state.connected {
            warn!("Device no longer present");
            self.state.connected = false;
            self.state.emmc_initialized = false;
            self.set_phase(Stage2Phase::Disconnected);
        }
        Err(TransportError::Disconnected.into())
    }

    /// Link check, lazy probe, then enter `phase`.
    fn begin(&mut self, phase: Stage2Phase) -> Result<()> {
        self.ensure_connected()?;
        if self.state.hw_code.is_none() {
            self.connect()?;
        }
        self.set_phase(phase);
        Ok(())
    }

    fn ensure_emmc(&mut self) -> Result<()> {
        if !self.state.emmc_initialized {
            StorageReader::new(&mut self.framer, self.observer.as_ref()).init_emmc()?;
            self.state.emmc_initialized = true;
        }
        Ok(())
    }

    /// Settle the session after an operation. A transport fault drops the
    /// link for good; anything else returns to `Ready`, or to `Disconnected`
    /// while the chip is still unknown.
    fn finish<R>(&mut self, operation: &str, result: Result<R>) -> Result<R> {
        match &result {
            Ok(_) => {
                self.observer.on_event(&Stage2Event::Complete {
                    operation: operation.to_string(),
                });
                self.set_phase(Stage2Phase::Ready);
            }
            Err(e) if e.is_link_fault() => {
                warn!(operation, error = %e, "Link lost");
                self.state.connected = false;
                self.state.emmc_initialized = false;
                self.set_phase(Stage2Phase::Disconnected);
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("{} failed: {}", operation, e));
                // A failed probe leaves the chip unresolved.
                let settled = if self.state.hw_code.is_some() {
                    Stage2Phase::Ready
                } else {
                    Stage2Phase::Disconnected
                };
                self.set_phase(settled);
            }
        }
        result
    }

    fn set_phase(&mut self, to: Stage2Phase) {
        let from = self.state.phase;
        if from != to {
            self.state.phase = to;
            self.observer
                .on_event(&Stage2Event::PhaseChanged { from, to });
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&Stage2Event::Log { level, message });
    }
}

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<T: ByteChannel, O: Stage2Observer> {
    inner: T,
    observer: Arc<O>,
}

impl<T: ByteChannel, O: Stage2Observer> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }
}

impl<T: ByteChannel, O: Stage2Observer> ByteChannel for ObservableTransport<T, O> {
    fn write(&self, data: &[u8]) -> std::result::Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.observer.on_event(&Stage2Event::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read(&self, len: usize) -> std::result::Result<Vec<u8>, TransportError> {
        let res = self.inner.read(len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&Stage2Event::Packet {
                direction: PacketDirection::Rx,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}
