//! nusb-based USB transport implementation.
//!
//! Key nusb 0.2 API patterns:
//! - `list_devices().wait()` for device enumeration
//! - `device_info.open().wait()` to open device
//! - `device.claim_interface(n).wait()` to claim interface
//! - `endpoint.submit(buffer)` + `wait_next_complete(timeout)` for bulk I/O

use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlType, Direction, In, Out, Recipient, TransferError,
};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    DeviceAddress, EndpointDirection, EndpointInfo, InterfaceInfo, TransportError,
    TransportOptions, UsbTransport, first_endpoint, select_interface,
};
use crate::protocol::constants::DEFAULT_MAX_PACKET_SIZE;

/// USB device seen during enumeration.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Claimed interface with its resolved bulk endpoints.
struct Link {
    ep_in: Endpoint<Bulk, In>,
    ep_out: Endpoint<Bulk, Out>,
    in_packet_size: usize,
    out_packet_size: usize,
    _interface: Interface,
    /// Interface 0 held to keep the CDC driver from rebinding, if claimed.
    _control: Option<Interface>,
}

/// nusb-based USB transport.
///
/// Either fully connected (interface claimed, both endpoints resolved) or
/// closed. There is no partially opened state.
pub struct NusbTransport {
    device: Device,
    link: Option<Link>,
    /// Interfaces whose kernel driver we detached and must reattach.
    detached: Vec<u8>,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first present device from `candidates`.
    #[instrument(level = "info", skip_all)]
    pub fn connect(
        candidates: &[DeviceAddress],
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let (device_info, target) = Self::discover(candidates)?;
        Self::open(device_info, target, options)
    }

    /// Find the first candidate present on the bus, in candidate order.
    pub fn discover(
        candidates: &[DeviceAddress],
    ) -> Result<(DeviceInfo, DeviceAddress), TransportError> {
        let devices: Vec<DeviceInfo> = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .collect();

        for candidate in candidates {
            if let Some(device_info) = devices
                .iter()
                .find(|d| candidate.matches(d.vendor_id(), d.product_id()))
            {
                return Ok((device_info.clone(), *candidate));
            }
        }

        debug!("Couldn't detect the device. Is it connected?");
        Err(TransportError::DeviceNotFound {
            candidates: candidates
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Open, configure and claim a discovered device.
    pub fn open(
        device_info: DeviceInfo,
        target: DeviceAddress,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
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

        let interfaces = describe_interfaces(&device)?;
        let selected = select_interface(&interfaces, target.interface, options.interface_class)?;
        let number = selected.number;
        debug!(interface = number, class = selected.class, "Selected interface");

        let mut detached = Vec::new();

        // The CDC driver binds interface 0 and claims the data interface
        // through it, so interface 0 is detached first.
        let control = if number != 0 {
            if detach_kernel_driver(&device, 0) {
                detached.push(0);
            }
            match device.claim_interface(0).wait() {
                Ok(interface) => Some(interface),
                Err(e) => {
                    debug!(error = %e, "Could not claim interface 0, continuing");
                    None
                }
            }
        } else {
            None
        };

        if detach_kernel_driver(&device, number) {
            detached.push(number);
        }
        let interface = device.claim_interface(number).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            }
        })?;

        let ep_in_info = resolve_endpoint(selected, options.endpoint_in, EndpointDirection::In)?;
        let ep_out_info = resolve_endpoint(selected, options.endpoint_out, EndpointDirection::Out)?;

        let ep_in = interface
            .endpoint::<Bulk, In>(ep_in_info.address)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let ep_out = interface
            .endpoint::<Bulk, Out>(ep_out_info.address)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            in_ep = %format!("0x{:02X}", ep_in_info.address),
            out_ep = %format!("0x{:02X}", ep_out_info.address),
            max_packet = ep_in_info.max_packet_size,
            "Device opened successfully"
        );

        let transport = Self {
            device,
            link: Some(Link {
                ep_in,
                ep_out,
                in_packet_size: ep_in_info.max_packet_size,
                out_packet_size: ep_out_info.max_packet_size,
                _interface: interface,
                _control: control,
            }),
            detached,
            timeout: options.timeout,
            vid,
            pid,
        };

        match transport.device_status() {
            Ok(status) => debug!(status = %format!("0x{:04X}", status), "Device status"),
            Err(e) => debug!(error = %e, "GET_STATUS failed"),
        }

        Ok(transport)
    }

    /// Enumerate all attached USB devices.
    pub fn list_attached() -> Result<Vec<AttachedDevice>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(devices
            .map(|d| AttachedDevice {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                manufacturer: d.manufacturer_string().map(str::to_string),
                product: d.product_string().map(str::to_string),
            })
            .collect())
    }

    /// Control IN transfer returning a little-endian 16-bit word.
    pub fn control_read_u16(
        &self,
        control_type: ControlType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
    ) -> Result<u16, TransportError> {
        let data = self
            .device
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    length: 2,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| classify(e, self.timeout))?;

        if data.len() < 2 {
            return Err(TransportError::ReadFailed(format!(
                "control transfer returned {} bytes",
                data.len()
            )));
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    /// Standard GET_STATUS request on the device.
    pub fn device_status(&self) -> Result<u16, TransportError> {
        self.control_read_u16(ControlType::Standard, Recipient::Device, 0x00, 0, 0)
    }
}

impl UsbTransport for NusbTransport {
    fn write_packet(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let timeout = self.timeout;
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        link.ep_out.submit(Buffer::from(data.to_vec()));
        let completion = match link.ep_out.wait_next_complete(timeout) {
            Some(completion) => completion,
            None => {
                link.ep_out.cancel_all();
                let _ = link.ep_out.wait_next_complete(timeout);
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        completion.status.map_err(|e| classify(e, timeout))?;
        Ok(completion.actual_len)
    }

    fn read_packet(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        let mut buffer = Buffer::new(len);
        buffer.set_requested_len(len);
        link.ep_in.submit(buffer);

        let completion = match link.ep_in.wait_next_complete(timeout) {
            Some(completion) => completion,
            None => {
                link.ep_in.cancel_all();
                // The transfer may have completed while being cancelled.
                match link.ep_in.wait_next_complete(timeout) {
                    Some(c) if c.status.is_ok() && c.actual_len > 0 => c,
                    _ => {
                        return Err(TransportError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            }
        };
        completion.status.map_err(|e| classify(e, timeout))?;

        let n = completion.actual_len.min(completion.buffer.len());
        Ok(completion.buffer[..n].to_vec())
    }

    fn out_packet_size(&self) -> usize {
        self.link
            .as_ref()
            .map_or(DEFAULT_MAX_PACKET_SIZE, |l| l.out_packet_size)
    }

    fn in_packet_size(&self) -> usize {
        self.link
            .as_ref()
            .map_or(DEFAULT_MAX_PACKET_SIZE, |l| l.in_packet_size)
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn close(&mut self, reset: bool) {
        let Some(link) = self.link.take() else {
            return;
        };
        // Dropping the link releases the endpoints and interfaces.
        drop(link);

        if reset {
            match self.device.reset().wait() {
                Ok(()) => debug!("Device reset"),
                Err(e) => warn!(error = %e, "Device reset failed"),
            }
        }

        for interface in self.detached.drain(..) {
            attach_kernel_driver(&self.device, interface);
        }
        info!("Device closed");
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Active configuration's interfaces, setting the first configuration if
/// the device is unconfigured.
fn describe_interfaces(device: &Device) -> Result<Vec<InterfaceInfo>, TransportError> {
    let config = match device.active_configuration() {
        Ok(config) => config,
        Err(e) => {
            debug!(error = %e, "Configuration not set, selecting the first one");
            let value = device
                .configurations()
                .next()
                .map(|c| c.configuration_value())
                .ok_or_else(|| {
                    TransportError::ConfigurationError("device has no configurations".into())
                })?;
            device
                .set_configuration(value)
                .wait()
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            device
                .active_configuration()
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?
        }
    };

    let mut interfaces = Vec::new();
    for iface in config.interfaces() {
        let Some(alt) = iface.alt_settings().next() else {
            continue;
        };
        let endpoints = alt
            .endpoints()
            .filter(|ep| ep.transfer_type() == TransferType::Bulk)
            .map(|ep| EndpointInfo {
                address: ep.address(),
                direction: match ep.direction() {
                    Direction::In => EndpointDirection::In,
                    Direction::Out => EndpointDirection::Out,
                },
                max_packet_size: ep.max_packet_size(),
            })
            .collect();
        interfaces.push(InterfaceInfo {
            number: iface.interface_number(),
            class: alt.class(),
            endpoints,
        });
    }
    Ok(interfaces)
}

/// Endpoint from an explicit override or the first one of `direction`.
fn resolve_endpoint(
    interface: &InterfaceInfo,
    override_address: Option<u8>,
    direction: EndpointDirection,
) -> Result<EndpointInfo, TransportError> {
    match override_address {
        Some(address) => Ok(interface
            .endpoints
            .iter()
            .find(|ep| ep.address == address)
            .copied()
            .unwrap_or(EndpointInfo {
                address,
                direction,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            })),
        None => first_endpoint(&interface.endpoints, direction)
            .copied()
            .ok_or(TransportError::EndpointNotFound { direction }),
    }
}

fn classify(error: TransferError, timeout: Duration) -> TransportError {
    match error {
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Stall => TransportError::Fault("endpoint stalled".into()),
        other => TransportError::Fault(other.to_string()),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn detach_kernel_driver(device: &Device, interface: u8) -> bool {
    match device.detach_kernel_driver(interface) {
        Ok(()) => {
            debug!(interface, "Detaching kernel driver");
            true
        }
        Err(e) => {
            debug!(interface, error = %e, "No kernel driver detached");
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn detach_kernel_driver(_device: &Device, _interface: u8) -> bool {
    false
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn attach_kernel_driver(device: &Device, interface: u8) {
    match device.attach_kernel_driver(interface) {
        Ok(()) => debug!(interface, "Reattached kernel driver"),
        Err(e) => debug!(interface, error = %e, "Kernel driver reattach failed"),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn attach_kernel_driver(_device: &Device, _interface: u8) {}
