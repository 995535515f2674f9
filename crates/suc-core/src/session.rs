//! Upload Session - High-level orchestrator for memory dumps.
//!
//! Sequences connect -> handshake -> probe -> download(s) -> postamble and
//! maps probe-table entries or explicit ranges to output files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::engine::{EngineOptions, UploadProtocol};
use crate::events::{UploadEvent, UploadObserver, UploadPhase};
use crate::probe::{ProbeTable, decode_with_threshold};
use crate::protocol::address::{AddressPadding, TransferRange};
use crate::protocol::constants::{
    CDC_DATA_CLASS, DEFAULT_MIN_RECORD_START, DEFAULT_PAGE_SIZE, DEFAULT_STALL_LIMIT,
    DEFAULT_TIMEOUT_MS, MODEM_UPLOAD_PRODUCT_ID, PROBE_MAX_LEN, SAMSUNG_VENDOR_ID,
};
use crate::transport::{DeviceAddress, NusbTransport, TransportOptions, UsbTransport};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Area number {index} is too high, device reported {count} areas")]
    PartitionIndexOutOfRange { index: usize, count: usize },

    #[error("Refusing to clear {}: {reason}", path.display())]
    UnsafeOutputDir { path: PathBuf, reason: &'static str },
}

/// Configuration for an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Candidate devices, tried in order.
    pub devices: Vec<DeviceAddress>,
    /// Interface class for automatic interface selection.
    pub interface_class: Option<u8>,
    /// Bulk IN endpoint override.
    pub endpoint_in: Option<u8>,
    /// Bulk OUT endpoint override.
    pub endpoint_out: Option<u8>,
    /// Bulk transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Directory for per-partition dumps.
    pub output_dir: PathBuf,
    /// Progress page (sector) size in bytes.
    pub page_size: u64,
    /// Probe records starting below this end the table.
    pub min_record_start: u64,
    /// Zero-pad 32-bit range boundaries to 8 digits.
    pub pad_32: bool,
    /// Zero-pad 64-bit range boundaries to 16 digits; off selects the
    /// legacy unpadded form.
    pub pad_64: bool,
    /// Consecutive empty reads tolerated during a download.
    pub stall_limit: u32,
    /// Upper bound for the probe response in bytes.
    pub probe_max_len: usize,
    /// Reset the device when the session is closed.
    pub reset_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceAddress::new(SAMSUNG_VENDOR_ID, MODEM_UPLOAD_PRODUCT_ID)],
            interface_class: Some(CDC_DATA_CLASS),
            endpoint_in: None,
            endpoint_out: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            output_dir: PathBuf::from("memory"),
            page_size: DEFAULT_PAGE_SIZE,
            min_record_start: DEFAULT_MIN_RECORD_START,
            pad_32: true,
            pad_64: true,
            stall_limit: DEFAULT_STALL_LIMIT,
            probe_max_len: PROBE_MAX_LEN,
            reset_on_close: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            interface_class: self.interface_class,
            endpoint_in: self.endpoint_in,
            endpoint_out: self.endpoint_out,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            padding: AddressPadding {
                bits32: self.pad_32,
                bits64: self.pad_64,
            },
            stall_limit: self.stall_limit,
            probe_max_len: self.probe_max_len,
            min_record_start: self.min_record_start,
            page_size: self.page_size,
        }
    }
}

/// Outcome of one partition in a bulk run.
#[derive(Debug)]
pub struct AreaOutcome {
    pub name: String,
    pub path: PathBuf,
    /// Bytes written, or the failure description.
    pub result: Result<u64, String>,
}

/// Outcomes of a bulk run, in probe-table order.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub areas: Vec<AreaOutcome>,
}

impl BulkReport {
    pub fn failures(&self) -> impl Iterator<Item = &AreaOutcome> {
        self.areas.iter().filter(|a| a.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Upload Session - orchestrates probing and dumping.
pub struct UploadSession<T: UsbTransport, O: UploadObserver> {
    config: SessionConfig,
    engine: UploadProtocol<T, O>,
    observer: Arc<O>,
    phase: UploadPhase,
    table: Option<ProbeTable>,
}

impl<O: UploadObserver> UploadSession<NusbTransport, O> {
    /// Open the first configured device and perform the handshake.
    #[instrument(skip_all)]
    pub fn connect(config: SessionConfig, observer: Arc<O>) -> Result<Self> {
        info!("Looking for device...");
        let transport = NusbTransport::connect(&config.devices, &config.transport_options())
            .context("Couldn't connect to the device")?;
        Self::with_transport(transport, config, observer)
    }
}

impl<T: UsbTransport, O: UploadObserver> UploadSession<T, O> {
    /// Start a session on an already opened transport.
    pub fn with_transport(transport: T, config: SessionConfig, observer: Arc<O>) -> Result<Self> {
        observer.on_event(&UploadEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });

        let engine = UploadProtocol::new(transport, observer.clone(), config.engine_options());
        let mut session = Self {
            config,
            engine,
            observer,
            phase: UploadPhase::Connecting,
            table: None,
        };

        session.set_phase(UploadPhase::Handshake);
        if let Err(e) = session.engine.handshake() {
            let _ = session.engine.close(false);
            return Err(e).context("Sorry, but device isn't in upload mode");
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> &UploadProtocol<T, O> {
        &self.engine
    }

    /// Partition table from the last probe.
    pub fn table(&self) -> Option<&ProbeTable> {
        self.table.as_ref()
    }

    fn set_phase(&mut self, to: UploadPhase) {
        let from = self.phase;
        self.phase = to;
        self.observer
            .on_event(&UploadEvent::PhaseChanged { from, to });
    }

    /// Query and decode the partition table.
    pub fn probe(&mut self) -> Result<&ProbeTable> {
        self.set_phase(UploadPhase::Probe);
        let table = self.engine.probe().context("Probe failed")?;
        Ok(self.store_table(table))
    }

    /// Probe and also write the raw response to `path`.
    pub fn capture_probe(&mut self, path: &Path) -> Result<&ProbeTable> {
        self.set_phase(UploadPhase::Probe);
        let raw = self.engine.probe_raw().context("Probe failed")?;
        fs::write(path, &raw)
            .with_context(|| format!("Failed to save probe response to {}", path.display()))?;
        info!(path = %path.display(), bytes = raw.len(), "Saved probe response");

        let table =
            decode_with_threshold(&raw, self.config.min_record_start).context("Probe failed")?;
        self.engine.set_address_mode(table.mode);
        Ok(self.store_table(table))
    }

    fn store_table(&mut self, table: ProbeTable) -> &ProbeTable {
        self.observer.on_event(&UploadEvent::ProbeComplete {
            table: table.clone(),
        });
        self.table.insert(table)
    }

    fn ensure_probed(&mut self) -> Result<()> {
        if self.table.is_none() {
            self.probe()?;
        }
        Ok(())
    }

    /// Download one probed partition into the output directory.
    #[instrument(skip(self))]
    pub fn download_partition(&mut self, index: usize) -> Result<PathBuf> {
        self.ensure_probed()?;
        let record = match self.table.as_ref().and_then(|t| t.get(index)) {
            Some(record) => record.clone(),
            None => {
                let count = self.table.as_ref().map_or(0, |t| t.len());
                return Err(SessionError::PartitionIndexOutOfRange { index, count }.into());
            }
        };

        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create {}", self.config.output_dir.display())
        })?;
        let path = self.config.output_dir.join(record.file_name());
        let range = record
            .range()
            .with_context(|| format!("Invalid range for \"{}\"", record.name))?;
        self.download_to_file(range, &path)?;
        Ok(path)
    }

    /// Download every probed partition into a freshly recreated output
    /// directory. Failures are recorded and the run continues.
    #[instrument(skip(self))]
    pub fn download_all(&mut self) -> Result<BulkReport> {
        self.ensure_probed()?;
        let records = self
            .table
            .as_ref()
            .map(|t| t.records.clone())
            .unwrap_or_default();

        recreate_dir(&self.config.output_dir)?;

        let mut report = BulkReport::default();
        for record in records {
            let path = self.config.output_dir.join(record.file_name());
            let result = match record.range() {
                Ok(range) => self.download_to_file(range, &path),
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("Invalid range for \"{}\"", record.name))),
            }
            .map_err(|e| format!("{:#}", e));
            if let Err(e) = &result {
                warn!(area = %record.name, error = %e, "Area failed, continuing");
            }
            report.areas.push(AreaOutcome {
                name: record.name,
                path,
                result,
            });
        }
        Ok(report)
    }

    /// Download an explicit inclusive range into `path`.
    pub fn download_range(&mut self, range: TransferRange, path: &Path) -> Result<u64> {
        self.download_to_file(range, path)
    }

    /// Try to dump the whole address space of the current address mode.
    pub fn dump_full(&mut self, path: &Path) -> Result<u64> {
        let range = self.engine.address_mode().full_range();
        info!(range = %range, "Dumping full address space");
        self.download_to_file(range, path)
    }

    fn download_to_file(&mut self, range: TransferRange, path: &Path) -> Result<u64> {
        self.set_phase(UploadPhase::Download);
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        // Flush before looking at the outcome so partial dumps reach disk.
        let result = self.engine.download_range(range, &mut writer, &label);
        let flushed = writer.flush();

        let bytes = result.with_context(|| format!("Failed to download \"{}\"", label))?;
        flushed.with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(bytes)
    }

    /// Send the postamble and release the device.
    pub fn finish(mut self) -> Result<()> {
        self.set_phase(UploadPhase::Complete);
        let reset = self.config.reset_on_close;
        self.engine.close(reset).context("Postamble not acknowledged")
    }
}

/// Remove and recreate `dir`.
fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let home = std::env::var_os("HOME").map(PathBuf::from);
        check_clearable(dir, &cwd, home.as_deref())?;
        fs::remove_dir_all(dir).with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}

/// A directory may be cleared only if it holds neither `cwd` nor `home` and
/// contains nothing but regular files, like a previous dump.
fn check_clearable(dir: &Path, cwd: &Path, home: Option<&Path>) -> Result<(), SessionError> {
    let refuse = |reason| SessionError::UnsafeOutputDir {
        path: dir.to_path_buf(),
        reason,
    };
    let resolved = dir.canonicalize().map_err(|_| refuse("cannot be resolved"))?;

    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    if cwd.starts_with(&resolved) {
        return Err(refuse("contains the working directory"));
    }
    if let Some(home) = home {
        let home = home.canonicalize().unwrap_or_else(|_| home.to_path_buf());
        if home.starts_with(&resolved) {
            return Err(refuse("contains the home directory"));
        }
    }

    let entries = fs::read_dir(&resolved).map_err(|_| refuse("cannot be listed"))?;
    for entry in entries {
        let file_type = entry
            .and_then(|e| e.file_type())
            .map_err(|_| refuse("cannot be listed"))?;
        if !file_type.is_file() {
            return Err(refuse("does not look like a previous dump"));
        }
    }
    Ok(())
}

/// Decode a probe table captured to disk.
pub fn read_probe_file<P: AsRef<Path>>(path: P, min_record_start: u64) -> Result<ProbeTable> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode_with_threshold(&data, min_record_start)
        .with_context(|| format!("Malformed probe table in {}", path.display()))
}
