//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlOut, ControlType, In, Out, Recipient, TransferError};
use nusb::{DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{CONTROL_REQUEST_LOAD, MASKROM_VENDOR_IDS, device_family};

/// One enumerated maskrom-mode device.
#[derive(Debug, Clone)]
pub struct MaskromDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    /// Device family resolved from the product ID table, if known.
    pub family: Option<&'static str>,
    pub bus: u8,
    pub address: u8,
}

/// Enumerate all devices currently in maskrom mode.
pub fn list_maskrom_devices() -> Result<Vec<MaskromDeviceInfo>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    Ok(devices
        .filter(|d| MASKROM_VENDOR_IDS.contains(&d.vendor_id()))
        .map(|d| MaskromDeviceInfo {
            vid: d.vendor_id(),
            pid: d.product_id(),
            family: device_family(d.product_id()),
            bus: d.bus_id().parse().unwrap_or(0),
            address: d.device_address(),
        })
        .collect())
}

/// nusb-based maskrom transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the `index`-th maskrom device on the bus.
    #[instrument(level = "info")]
    pub fn open(index: usize) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| MASKROM_VENDOR_IDS.contains(&d.vendor_id()))
            .nth(index)
            .ok_or(TransportError::DeviceNotFound { index })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            family = device_family(pid).unwrap_or("unknown"),
            "Found maskrom device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == 0 {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }

    fn map_transfer_error(e: TransferError, timeout: Duration) -> TransportError {
        match e {
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Cancelled => TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            other => TransportError::ReadFailed(other.to_string()),
        }
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);
        ep.transfer_blocking(buf, timeout)
            .into_result()
            .map_err(|e| match Self::map_transfer_error(e, timeout) {
                TransportError::ReadFailed(msg) => TransportError::WriteFailed(msg),
                other => other,
            })?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(len))]
    fn bulk_read(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // the transfer length must be a multiple of the endpoint's max
        // packet size or short device packets error out
        let max_packet = ep.max_packet_size();
        let request_len = len.div_ceil(max_packet) * max_packet;
        let mut buf = Buffer::new(request_len);
        buf.set_requested_len(request_len);

        let data = ep
            .transfer_blocking(buf, timeout)
            .into_result()
            .map_err(|e| Self::map_transfer_error(e, timeout))?;

        let out = data.to_vec();
        if out.len() > len {
            return Err(TransportError::Overflow);
        }
        debug!(bytes_read = out.len(), "Read complete");
        Ok(out)
    }

    #[instrument(skip(self, chunk), fields(index, len = chunk.len()))]
    fn vendor_load(
        &self,
        index: u16,
        chunk: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: CONTROL_REQUEST_LOAD,
                    value: 0,
                    index,
                    data: chunk,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))?;
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
