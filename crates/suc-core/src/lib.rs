//! SUC-Core: Samsung modem upload-mode protocol implementation in Rust.
//!
//! A crashed modem that enters "upload mode" re-enumerates as a USB device
//! and answers a small plaintext command protocol. This crate talks that
//! protocol to read the device's memory partition table and dump memory
//! ranges to files.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command tokens, constants, hex address encoding
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Probe**: Partition table decoding (32-bit and 64-bit layouts)
//! - **Engine**: Handshake, probe and range download state machine
//! - **Progress**: Percentage, ETA and throughput accounting
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator mapping areas to files
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use suc_core::session::{SessionConfig, UploadSession};
//! use suc_core::events::TracingObserver;
//!
//! let config = SessionConfig::default();
//! let mut session = UploadSession::connect(config, Arc::new(TracingObserver))?;
//! session.probe()?;
//! let report = session.download_all()?;
//! assert!(report.all_succeeded());
//! session.finish()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod engine;
pub mod events;
pub mod probe;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use engine::{EngineOptions, ProtocolError, UploadProtocol};
pub use events::{NullObserver, TracingObserver, UploadEvent, UploadObserver, UploadPhase};
pub use probe::{PartitionRecord, ProbeError, ProbeTable};
pub use progress::{ProgressReport, ProgressReporter};
pub use protocol::{AddressEncoding, AddressMode, Response, TransferRange};
pub use session::{BulkReport, SessionConfig, SessionError, UploadSession};
pub use state::EngineState;
pub use transport::{
    DeviceAddress, MockTransport, NusbTransport, TransportError, TransportOptions, UsbTransport,
};
