//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow protocol activity and
//! progress without the core knowing how it is rendered.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Phase {
    /// No link yet, or link lost.
    Disconnected,
    /// Reading the hardware code and resolving the chip configuration.
    Probe,
    /// Idle and ready for commands.
    Ready,
    /// Bulk storage read in progress.
    StorageRead,
    /// Memory read or write in progress.
    MemoryAccess,
    /// Hardware crypto requests in progress.
    Crypto,
    /// Device is rebooting; the link is gone.
    Rebooting,
}

impl fmt::Display for Stage2Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage2Phase::Disconnected => write!(f, "Disconnected"),
            Stage2Phase::Probe => write!(f, "Probe"),
            Stage2Phase::Ready => write!(f, "Ready"),
            Stage2Phase::StorageRead => write!(f, "Storage Read"),
            Stage2Phase::MemoryAccess => write!(f, "Memory Access"),
            Stage2Phase::Crypto => write!(f, "Crypto"),
            Stage2Phase::Rebooting => write!(f, "Rebooting"),
        }
    }
}

/// Events emitted by the stage2 session.
#[derive(Debug, Clone)]
pub enum Stage2Event {
    /// Device connected.
    DeviceConnected { vid: u16, pid: u16 },
    /// Phase changed.
    PhaseChanged { from: Stage2Phase, to: Stage2Phase },
    /// Progress update for current operation.
    Progress {
        phase: Stage2Phase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// USB Packet sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Operation completed successfully.
    Complete { operation: String },
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait Stage2Observer: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &Stage2Event);

    /// Polled between sectors and chunks of long operations. Returning
    /// `true` stops the operation at that boundary.
    fn should_abort(&self) -> bool {
        false
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl Stage2Observer for NullObserver {
    fn on_event(&self, _event: &Stage2Event) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl Stage2Observer for TracingObserver {
    fn on_event(&self, event: &Stage2Event) {
        match event {
            Stage2Event::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            Stage2Event::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            Stage2Event::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 1000) / *total
                } else {
                    0
                };
                tracing::debug!(
                    phase = %phase,
                    operation = %operation,
                    progress = %format!("{}.{}%", pct / 10, pct % 10),
                    "Progress"
                );
            }
            Stage2Event::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            Stage2Event::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "USB Packet");
            }
            Stage2Event::Complete { operation } => {
                tracing::info!(operation = %operation, "Operation complete");
            }
        }
    }
}

/// Emits `Progress` events at most once per 0.1% step.
#[derive(Debug)]
pub struct ProgressThrottle {
    total: u64,
    last_permille: Option<u64>,
}

impl ProgressThrottle {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            last_permille: None,
        }
    }

    /// Returns true when `current` moved past the last reported 0.1% step.
    pub fn advance(&mut self, current: u64) -> bool {
        if self.total == 0 {
            return false;
        }
        let permille = current.saturating_mul(1000) / self.total;
        match self.last_permille {
            Some(last) if permille <= last => false,
            _ => {
                self.last_permille = Some(permille);
                true
            }
        }
    }
}
