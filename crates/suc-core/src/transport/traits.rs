//! USB Transport layer abstraction.
//!
//! Backends implement raw single-packet bulk I/O. The chunked write and the
//! accumulating read that the upload protocol relies on are provided methods,
//! so every backend (nusb, mock) shares the same retry and timeout policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::protocol::constants::{DEFAULT_TIMEOUT_MS, WRITE_RETRY_LIMIT};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No matching device found (tried {candidates})")]
    DeviceNotFound { candidates: String },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("No usable configuration: {0}")]
    ConfigurationError(String),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type=Bulk, direction={direction}")]
    EndpointNotFound { direction: EndpointDirection },

    #[error("Write failed after {attempts} attempts: {message}")]
    WriteFailed { attempts: u32, message: String },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("USB overflow")]
    Overflow,

    #[error("USB fault: {0}")]
    Fault(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Transport is not connected")]
    NotConnected,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Errors after which retrying the same packet is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::NotConnected
        )
    }
}

/// Candidate device: VID/PID plus an optional explicit interface number.
///
/// `interface: None` selects the interface automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub interface: Option<u8>,
}

impl DeviceAddress {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            interface: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)?;
        if let Some(interface) = self.interface {
            write!(f, "#{}", interface)?;
        }
        Ok(())
    }
}

/// Options applied when opening a device.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Interface class used when the candidate leaves the interface on auto.
    pub interface_class: Option<u8>,
    /// Bulk IN endpoint address, overriding descriptor lookup.
    pub endpoint_in: Option<u8>,
    /// Bulk OUT endpoint address, overriding descriptor lookup.
    pub endpoint_out: Option<u8>,
    /// Per-transfer timeout.
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            interface_class: None,
            endpoint_in: None,
            endpoint_out: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Endpoint direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

impl EndpointDirection {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn of_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }
}

impl fmt::Display for EndpointDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointDirection::In => write!(f, "In"),
            EndpointDirection::Out => write!(f, "Out"),
        }
    }
}

/// Bulk endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: EndpointDirection,
    pub max_packet_size: usize,
}

/// Interface descriptor (first alternate setting), bulk endpoints only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// First endpoint in `endpoints` with the given direction.
pub fn first_endpoint(
    endpoints: &[EndpointInfo],
    direction: EndpointDirection,
) -> Option<&EndpointInfo> {
    endpoints.iter().find(|ep| ep.direction == direction)
}

/// Pick the interface to claim.
///
/// An explicit number must exist. Otherwise the first interface of `class`
/// is taken, or the first interface at all when no class filter is given.
pub fn select_interface<'a>(
    interfaces: &'a [InterfaceInfo],
    explicit: Option<u8>,
    class: Option<u8>,
) -> Result<&'a InterfaceInfo, TransportError> {
    match (explicit, class) {
        (Some(number), _) => interfaces
            .iter()
            .find(|i| i.number == number)
            .ok_or_else(|| {
                TransportError::InterfaceNotFound(format!(
                    "interface {} (device has {})",
                    number,
                    interfaces.len()
                ))
            }),
        (None, Some(class)) => interfaces
            .iter()
            .find(|i| i.class == class)
            .ok_or_else(|| {
                TransportError::InterfaceNotFound(format!("no interface of class 0x{:02X}", class))
            }),
        (None, None) => interfaces
            .first()
            .ok_or_else(|| TransportError::InterfaceNotFound("device has no interfaces".into())),
    }
}

/// Abstract USB transport interface.
///
/// A transport is exclusively owned by one protocol engine; all methods take
/// `&mut self`, so one command is in flight at a time by construction.
pub trait UsbTransport: Send {
    /// Submit one bulk OUT transfer of at most one packet.
    fn write_packet(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Receive one bulk IN transfer of up to `len` bytes.
    fn read_packet(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Max packet size of the OUT endpoint.
    fn out_packet_size(&self) -> usize;

    /// Max packet size of the IN endpoint.
    fn in_packet_size(&self) -> usize;

    /// Check if the transport still holds a claimed interface.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;

    /// Release the device. Best effort, safe to call in any state.
    fn close(&mut self, reset: bool);

    /// Write a payload in packet-sized chunks.
    ///
    /// An empty payload is sent as a zero-length packet; if that times out it
    /// is retried once and then considered delivered. Non-empty chunks are
    /// retried until `WRITE_RETRY_LIMIT` consecutive failures.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return match self.write_packet(&[]) {
                Ok(_) => Ok(()),
                Err(e) if e.is_timeout() => {
                    debug!("Zero-length write timed out, retrying once");
                    match self.write_packet(&[]) {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_timeout() => {
                            debug!("Zero-length write unacknowledged, continuing");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
        }

        let chunk_size = self.out_packet_size().max(1);
        let mut pos = 0;
        let mut failures = 0u32;
        while pos < data.len() {
            let end = (pos + chunk_size).min(data.len());
            match self.write_packet(&data[pos..end]) {
                Ok(_) => {
                    failures = 0;
                    pos = end;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    warn!(offset = pos, attempt = failures, error = %e, "Bulk write failed");
                    if failures >= WRITE_RETRY_LIMIT {
                        return Err(TransportError::WriteFailed {
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        trace!(bytes = data.len(), "Write complete");
        Ok(())
    }

    /// Read one response unit.
    ///
    /// Packets are accumulated until `max_len` bytes arrived or a short packet
    /// ends the unit. A timeout ends the unit too and returns whatever was
    /// received, possibly nothing. Overflow and other faults are errors.
    fn read(&mut self, max_len: Option<usize>) -> Result<Vec<u8>, TransportError> {
        let packet_size = self.in_packet_size().max(1);
        let limit = max_len.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        while out.len() < limit {
            match self.read_packet(packet_size) {
                Ok(chunk) => {
                    let short = chunk.len() < packet_size;
                    out.extend_from_slice(&chunk);
                    if short {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => {
                    trace!(received = out.len(), "Read timed out, ending unit");
                    break;
                }
                Err(TransportError::Overflow) => {
                    error!("USB Overflow");
                    return Err(TransportError::Overflow);
                }
                Err(e) => {
                    debug!(error = %e, received = out.len(), "Read failed");
                    return Err(e);
                }
            }
        }

        trace!(bytes = out.len(), "Read complete");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8) -> EndpointInfo {
        EndpointInfo {
            address,
            direction: EndpointDirection::of_address(address),
            max_packet_size: 512,
        }
    }

    fn interfaces() -> Vec<InterfaceInfo> {
        vec![
            InterfaceInfo {
                number: 0,
                class: 0x02,
                endpoints: vec![],
            },
            InterfaceInfo {
                number: 1,
                class: 0x0A,
                endpoints: vec![ep(0x02), ep(0x81), ep(0x83)],
            },
        ]
    }

    #[test]
    fn test_select_by_class() {
        let list = interfaces();
        assert_eq!(select_interface(&list, None, Some(0x0A)).unwrap().number, 1);
        assert_eq!(select_interface(&list, None, None).unwrap().number, 0);
        assert_eq!(select_interface(&list, Some(1), Some(0x02)).unwrap().number, 1);
    }

    #[test]
    fn test_select_missing() {
        let list = interfaces();
        assert!(matches!(
            select_interface(&list, Some(4), None),
            Err(TransportError::InterfaceNotFound(_))
        ));
        assert!(matches!(
            select_interface(&list, None, Some(0x08)),
            Err(TransportError::InterfaceNotFound(_))
        ));
        assert!(select_interface(&[], None, None).is_err());
    }

    #[test]
    fn test_first_endpoint() {
        let list = interfaces();
        let eps = &list[1].endpoints;
        assert_eq!(
            first_endpoint(eps, EndpointDirection::In).unwrap().address,
            0x81
        );
        assert_eq!(
            first_endpoint(eps, EndpointDirection::Out).unwrap().address,
            0x02
        );
        assert!(first_endpoint(&list[0].endpoints, EndpointDirection::In).is_none());
    }

    #[test]
    fn test_device_address_display() {
        let mut addr = DeviceAddress::new(0x04E8, 0x685D);
        assert_eq!(addr.to_string(), "04E8:685D");
        addr.interface = Some(1);
        assert_eq!(addr.to_string(), "04E8:685D#1");
        assert!(addr.matches(0x04E8, 0x685D));
    }
}
