//! Event system for UI decoupling.
//!
//! Allows CLI/TUI/GUI to subscribe to upload events without
//! tight coupling to the core logic.

use std::fmt;

use crate::probe::ProbeTable;
use crate::progress::ProgressReport;
use crate::protocol::address::TransferRange;

/// Upload session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// Looking for a device on the bus.
    Connecting,
    /// `PrEaMbLe` / `AcKnOwLeDgMeNt` exchange.
    Handshake,
    /// Reading the partition table.
    Probe,
    /// Range download in progress.
    Download,
    /// Session finished with `PoStAmBlE`.
    Complete,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadPhase::Connecting => write!(f, "Connecting"),
            UploadPhase::Handshake => write!(f, "Handshake"),
            UploadPhase::Probe => write!(f, "Probe"),
            UploadPhase::Download => write!(f, "Download"),
            UploadPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted by the upload session.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Device opened and interface claimed.
    DeviceConnected { vid: u16, pid: u16 },
    /// Phase changed.
    PhaseChanged { from: UploadPhase, to: UploadPhase },
    /// Partition table decoded.
    ProbeComplete { table: ProbeTable },
    /// A range download is starting.
    TransferStarted { label: String, range: TransferRange },
    /// Progress update for the current range.
    Progress { label: String, report: ProgressReport },
    /// A range download ended, successfully or not.
    TransferFinished {
        label: String,
        bytes: u64,
        success: bool,
    },
    /// Device closed.
    DeviceClosed,
}

/// Observer trait for receiving upload events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UploadObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UploadEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UploadObserver for NullObserver {
    fn on_event(&self, _event: &UploadEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UploadObserver for TracingObserver {
    fn on_event(&self, event: &UploadEvent) {
        match event {
            UploadEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            UploadEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            UploadEvent::ProbeComplete { table } => {
                tracing::info!(
                    mode = %table.mode,
                    device = %table.device_name,
                    areas = table.len(),
                    "Probe complete"
                );
            }
            UploadEvent::TransferStarted { label, range } => {
                tracing::info!(file = %label, range = %range, bytes = range.len(), "Downloading");
            }
            UploadEvent::Progress { label, report } => {
                tracing::info!(
                    file = %label,
                    progress = %format!("{:.2}%", report.percent),
                    sector = %format!("0x{:X} of 0x{:X}", report.current_page, report.total_pages),
                    speed = %format!("{:.2} MB/s", report.throughput_mbps),
                    left = %format_remaining(report.remaining.as_secs()),
                    "Progress"
                );
            }
            UploadEvent::TransferFinished {
                label,
                bytes,
                success,
            } => {
                if *success {
                    tracing::info!(file = %label, bytes, "Transfer complete");
                } else {
                    tracing::warn!(file = %label, bytes, "Transfer incomplete");
                }
            }
            UploadEvent::DeviceClosed => {
                tracing::debug!("Device closed");
            }
        }
    }
}

/// Remaining time as `HHh:MMm:SSs`, `MMm:SSs` or `SSs`.
pub fn format_remaining(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{:02}h:{:02}m:{:02}s", h, m, s)
    } else if m > 0 {
        format!("{:02}m:{:02}s", m, s)
    } else {
        format!("{:02}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(5), "05s");
        assert_eq!(format_remaining(125), "02m:05s");
        assert_eq!(format_remaining(3725), "01h:02m:05s");
    }
}
