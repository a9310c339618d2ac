//! nusb-based USB transport implementation.
//!
//! The agent exposes one bulk IN/OUT pair. Both endpoints are claimed once
//! when the device is opened and kept for the lifetime of the transport, so
//! no buffered IN data is lost between two reads.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{ByteChannel, TransportError};
use crate::protocol::constants::{MTK_VENDOR_ID, SUPPORTED_PIDS};

const TRANSFER_SIZE: usize = 4096;

/// Bulk endpoint pair found on one interface.
#[derive(Debug, Clone, Copy)]
struct BulkPair {
    interface: u8,
    in_ep: u8,
    out_ep: u8,
}

/// nusb-based USB transport.
pub struct NusbTransport {
    _interface: Interface,
    reader: Mutex<EndpointRead<Bulk>>,
    writer: Mutex<EndpointWrite<Bulk>>,
    alive: AtomicBool,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open any MediaTek device in a supported mode.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == MTK_VENDOR_ID && SUPPORTED_PIDS.contains(&d.product_id()))
            .ok_or(TransportError::DeviceNotFound {
                vid: MTK_VENDOR_ID,
                pid: 0,
            })?;

        Self::open_device_info(device_info)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();
        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let pair = find_bulk_pair(&device).ok_or_else(|| TransportError::EndpointNotFound {
            ep_type: "Bulk".into(),
            direction: "In/Out".into(),
        })?;

        let interface = device.claim_interface(pair.interface).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: pair.interface,
                message: e.to_string(),
            }
        })?;

        let reader = interface
            .endpoint::<Bulk, In>(pair.in_ep)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .reader(TRANSFER_SIZE);
        let writer = interface
            .endpoint::<Bulk, Out>(pair.out_ep)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .writer(TRANSFER_SIZE);

        info!(
            interface = pair.interface,
            in_ep = %format!("0x{:02X}", pair.in_ep),
            out_ep = %format!("0x{:02X}", pair.out_ep),
            "Device opened successfully"
        );

        Ok(Self {
            _interface: interface,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
            vid,
            pid,
        })
    }

    fn fault(&self, err: TransportError) -> TransportError {
        self.alive.store(false, Ordering::SeqCst);
        err
    }
}

/// First alternate setting carrying both a bulk IN and a bulk OUT endpoint.
fn find_bulk_pair(device: &Device) -> Option<BulkPair> {
    let config = device.active_configuration().ok()?;
    for iface in config.interfaces() {
        for alt in iface.alt_settings() {
            let mut in_ep = None;
            let mut out_ep = None;
            for ep in alt.endpoints() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => in_ep = in_ep.or(Some(ep.address())),
                    Direction::Out => out_ep = out_ep.or(Some(ep.address())),
                }
            }
            if let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) {
                return Some(BulkPair {
                    interface: iface.interface_number(),
                    in_ep,
                    out_ep,
                });
            }
        }
    }
    None
}

impl ByteChannel for NusbTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TransportError::WriteFailed("endpoint lock poisoned".into()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| self.fault(TransportError::WriteFailed(e.to_string())))?;
        Ok(data.len())
    }

    #[instrument(level = "trace", skip(self))]
    fn read(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| TransportError::ReadFailed("endpoint lock poisoned".into()))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            let n = reader
                .read(&mut buf[filled..])
                .map_err(|e| self.fault(TransportError::ReadFailed(e.to_string())))?;
            if n == 0 {
                warn!(expected = len, received = filled, "Bulk IN ended early");
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        debug!(bytes_read = filled, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // Only a failed transfer tells us the device is gone.
        self.alive.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
