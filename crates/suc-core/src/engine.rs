//! Upload-mode protocol engine.
//!
//! Drives the plaintext command/acknowledgment exchange over a
//! [`UsbTransport`]:
//!
//! ```text
//! host                          device
//! PrEaMbLe\0            ->
//!                       <-      AcKnOwLeDgMeNt\0
//! PrObE\0               ->
//!                       <-      probe table (<= 32 KiB)
//! PrEaMbLe\0 / start\0 / end\0  each answered with AcKnOwLeDgMeNt\0
//! DaTaXfEr\0            ->
//!                       <-      data chunk
//! AcKnOwLeDgMeNt\0      ->      (repeat until end - start + 1 bytes)
//!                       <-      PoStAmBlE\0
//! PoStAmBlE\0           ->      end of session
//! ```

use std::io::Write;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{UploadEvent, UploadObserver};
use crate::probe::{ProbeError, ProbeTable, decode_with_threshold};
use crate::progress::ProgressReporter;
use crate::protocol::address::{
    AddressEncoding, AddressError, AddressMode, AddressPadding, TransferRange,
};
use crate::protocol::constants::{
    CMD_ACKNOWLEDGMENT, CMD_DATA_TRANSFER, CMD_POSTAMBLE, CMD_PREAMBLE, CMD_PROBE,
    DEFAULT_MIN_RECORD_START, DEFAULT_PAGE_SIZE, DEFAULT_STALL_LIMIT, POSTAMBLE_READ_LEN,
    PROBE_MAX_LEN,
};
use crate::protocol::token::{Response, starts_with_token, terminated};
use crate::state::EngineState;
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Device isn't in upload mode (handshake answered {response})")]
    ProtocolMismatch { response: Response },

    #[error("Unexpected response to {command}: {response}")]
    UnexpectedResponse { command: String, response: Response },

    #[error("Range setup failed for {range}: {source}")]
    RangeSetupFailed {
        range: TransferRange,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("Transfer stalled for {range} after {received} bytes ({empty_reads} empty reads)")]
    TransferStalled {
        range: TransferRange,
        received: u64,
        empty_reads: u32,
    },

    #[error("Incomplete transfer for {range}: {received} of {expected} bytes, trailer {trailer}")]
    IncompleteTransfer {
        range: TransferRange,
        received: u64,
        expected: u64,
        trailer: Response,
    },

    #[error("Transport fault during {range} after {received} bytes: {source}")]
    TransferFault {
        range: TransferRange,
        received: u64,
        #[source]
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed probe table: {0}")]
    Probe(#[from] ProbeError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Failed writing output: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        state: EngineState,
        operation: &'static str,
    },
}

impl ProtocolError {
    /// Bytes already delivered to the sink when a range download failed.
    pub fn bytes_received(&self) -> u64 {
        match self {
            ProtocolError::TransferStalled { received, .. }
            | ProtocolError::IncompleteTransfer { received, .. }
            | ProtocolError::TransferFault { received, .. } => *received,
            _ => 0,
        }
    }
}

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Zero-padded fixed-width range boundaries, per address mode.
    pub padding: AddressPadding,
    /// Consecutive empty reads before a download is declared stalled.
    pub stall_limit: u32,
    /// Upper bound for the probe response.
    pub probe_max_len: usize,
    /// Records starting below this end the probe table.
    pub min_record_start: u64,
    /// Progress page size in bytes.
    pub page_size: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            padding: AddressPadding::default(),
            stall_limit: DEFAULT_STALL_LIMIT,
            probe_max_len: PROBE_MAX_LEN,
            min_record_start: DEFAULT_MIN_RECORD_START,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Protocol engine owning one transport.
pub struct UploadProtocol<T: UsbTransport, O: UploadObserver> {
    transport: T,
    observer: Arc<O>,
    state: EngineState,
    encoding: AddressEncoding,
    options: EngineOptions,
    progress: ProgressReporter,
}

impl<T: UsbTransport, O: UploadObserver> UploadProtocol<T, O> {
    pub fn new(transport: T, observer: Arc<O>, options: EngineOptions) -> Self {
        Self {
            transport,
            observer,
            state: EngineState::Disconnected,
            encoding: AddressEncoding::new(AddressMode::Bits32, options.padding),
            progress: ProgressReporter::new(options.page_size),
            options,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn address_mode(&self) -> AddressMode {
        self.encoding.mode
    }

    pub fn encoding(&self) -> AddressEncoding {
        self.encoding
    }

    /// Select the address mode used for range boundaries.
    ///
    /// [`UploadProtocol::probe`] sets this from the device name; call it
    /// directly only when downloading without probing.
    pub fn set_address_mode(&mut self, mode: AddressMode) {
        self.encoding.mode = mode;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn goto_state(&mut self, new_state: EngineState) {
        if self.state != new_state {
            debug!(from = %self.state, to = %new_state, "State transition");
            self.state = new_state;
        }
    }

    fn require(&self, expected: EngineState, operation: &'static str) -> Result<(), ProtocolError> {
        if self.state != expected {
            return Err(ProtocolError::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn emit(&self, event: UploadEvent) {
        self.observer.on_event(&event);
    }

    /// Confirm the device is in upload mode.
    #[instrument(skip(self))]
    pub fn handshake(&mut self) -> Result<(), ProtocolError> {
        self.require(EngineState::Disconnected, "handshake")?;
        self.goto_state(EngineState::Handshaking);

        let result = self.exchange_handshake();
        match &result {
            Ok(()) => {
                info!("Device is in upload mode");
                self.goto_state(EngineState::Ready);
            }
            Err(ProtocolError::ProtocolMismatch { .. }) => {
                self.goto_state(EngineState::ProtocolMismatch)
            }
            Err(_) => self.goto_state(EngineState::Disconnected),
        }
        result
    }

    fn exchange_handshake(&mut self) -> Result<(), ProtocolError> {
        self.transport.write(&terminated(CMD_PREAMBLE))?;
        let packet_size = self.transport.in_packet_size();
        let data = self.transport.read(Some(packet_size))?;
        if !starts_with_token(&data, CMD_ACKNOWLEDGMENT) {
            return Err(ProtocolError::ProtocolMismatch {
                response: Response::from_bytes(&data),
            });
        }
        Ok(())
    }

    /// Request and decode the partition table.
    ///
    /// Sets the session's address mode from the table.
    #[instrument(skip(self))]
    pub fn probe(&mut self) -> Result<ProbeTable, ProtocolError> {
        self.require(EngineState::Ready, "probe")?;
        self.goto_state(EngineState::Probing);

        let result = self.exchange_probe();
        self.goto_state(EngineState::Ready);

        let table = result?;
        self.set_address_mode(table.mode);
        Ok(table)
    }

    fn exchange_probe(&mut self) -> Result<ProbeTable, ProtocolError> {
        self.transport.write(&terminated(CMD_PROBE))?;
        let data = self.transport.read(Some(self.options.probe_max_len))?;
        debug!(bytes = data.len(), "Probe response received");
        Ok(decode_with_threshold(&data, self.options.min_record_start)?)
    }

    /// Raw probe response, undecoded. Used to capture tables to disk.
    pub fn probe_raw(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.require(EngineState::Ready, "probe")?;
        self.goto_state(EngineState::Probing);
        let result = self
            .transport
            .write(&terminated(CMD_PROBE))
            .and_then(|()| self.transport.read(Some(self.options.probe_max_len)));
        self.goto_state(EngineState::Ready);
        Ok(result?)
    }

    /// Send a NUL-terminated command.
    ///
    /// With `expect_ack`, one response unit is read and must be the
    /// acknowledgment or the postamble token.
    pub fn command(&mut self, payload: &[u8], expect_ack: bool) -> Result<(), ProtocolError> {
        self.transport.write(&terminated(payload))?;
        if !expect_ack {
            return Ok(());
        }

        let packet_size = self.transport.in_packet_size();
        let response = Response::from_bytes(&self.transport.read(Some(packet_size))?);
        if !response.is_accepted() {
            return Err(ProtocolError::UnexpectedResponse {
                command: String::from_utf8_lossy(payload).into_owned(),
                response,
            });
        }
        Ok(())
    }

    /// Download the inclusive `range` into `sink`.
    ///
    /// Chunks are written to the sink as they arrive, so on failure the sink
    /// holds exactly the bytes received so far, in order.
    #[instrument(skip(self, sink))]
    pub fn download_range<W: Write>(
        &mut self,
        range: TransferRange,
        sink: &mut W,
        label: &str,
    ) -> Result<u64, ProtocolError> {
        self.require(EngineState::Ready, "download")?;
        let start = self.encoding.format(range.start)?;
        let end = self.encoding.format(range.end)?;

        self.goto_state(EngineState::Downloading);
        let result = self
            .setup_range(range, &start, &end)
            .and_then(|()| self.stream_range(range, sink, label));
        self.goto_state(EngineState::Ready);
        result
    }

    fn setup_range(
        &mut self,
        range: TransferRange,
        start: &str,
        end: &str,
    ) -> Result<(), ProtocolError> {
        debug!(start, end, "Setting up range");
        let setup_failed = |source: ProtocolError| ProtocolError::RangeSetupFailed {
            range,
            source: Box::new(source),
        };

        self.command(CMD_PREAMBLE, true).map_err(setup_failed)?;
        self.command(start.as_bytes(), true).map_err(setup_failed)?;
        self.command(end.as_bytes(), true).map_err(setup_failed)?;
        // The device starts streaming right away, there is no acknowledgment.
        self.command(CMD_DATA_TRANSFER, false).map_err(setup_failed)?;
        Ok(())
    }

    fn stream_range<W: Write>(
        &mut self,
        range: TransferRange,
        sink: &mut W,
        label: &str,
    ) -> Result<u64, ProtocolError> {
        let total = range.len();
        self.emit(UploadEvent::TransferStarted {
            label: label.to_string(),
            range,
        });
        self.report_progress(label, 0, total);

        let result = self.receive(range, sink, label, total);
        let received = match &result {
            Ok(n) => *n,
            Err(e) => e.bytes_received(),
        };
        self.emit(UploadEvent::TransferFinished {
            label: label.to_string(),
            bytes: received,
            success: result.is_ok(),
        });
        result
    }

    fn receive<W: Write>(
        &mut self,
        range: TransferRange,
        sink: &mut W,
        label: &str,
        total: u64,
    ) -> Result<u64, ProtocolError> {
        let mut received = 0u64;
        let mut empty_reads = 0u32;
        let mut excess = Vec::new();

        while received < total {
            let remaining = total - received;
            let want = usize::try_from(remaining).unwrap_or(usize::MAX);
            let mut chunk =
                self.transport
                    .read(Some(want))
                    .map_err(|source| ProtocolError::TransferFault {
                        range,
                        received,
                        source,
                    })?;

            if chunk.is_empty() {
                empty_reads += 1;
                warn!(received, empty_reads, "No data from device");
                if empty_reads >= self.options.stall_limit {
                    return Err(ProtocolError::TransferStalled {
                        range,
                        received,
                        empty_reads,
                    });
                }
                continue;
            }
            empty_reads = 0;

            if chunk.len() as u64 > remaining {
                excess = chunk.split_off(want);
                warn!(extra = excess.len(), "Device sent past the end of the range");
            }

            // Request the next chunk before storing this one. The chunk is
            // already ours, so it is stored even if the request fails.
            let acked = self.command(CMD_ACKNOWLEDGMENT, false);
            sink.write_all(&chunk)?;
            received += chunk.len() as u64;
            acked.map_err(|e| match e {
                ProtocolError::Transport(source) => ProtocolError::TransferFault {
                    range,
                    received,
                    source,
                },
                other => other,
            })?;
            self.report_progress(label, received, total);
        }

        let trailer = if excess.is_empty() {
            self.transport
                .read(Some(POSTAMBLE_READ_LEN))
                .map_err(|source| ProtocolError::TransferFault {
                    range,
                    received,
                    source,
                })?
        } else {
            excess
        };

        let trailer = Response::from_bytes(&trailer);
        if trailer != Response::Postamble {
            return Err(ProtocolError::IncompleteTransfer {
                range,
                received,
                expected: total,
                trailer,
            });
        }

        debug!(bytes = received, "Range complete");
        Ok(received)
    }

    fn report_progress(&mut self, label: &str, position: u64, total: u64) {
        if let Some(report) = self.progress.update(position, total) {
            self.emit(UploadEvent::Progress {
                label: label.to_string(),
                report,
            });
        }
    }

    /// End the session with `PoStAmBlE` and release the transport.
    ///
    /// The transport is released even if the postamble is not acknowledged.
    #[instrument(skip(self))]
    pub fn close(&mut self, reset: bool) -> Result<(), ProtocolError> {
        if self.state == EngineState::Closed {
            return Ok(());
        }

        let result = if self.state.is_ready() {
            self.command(CMD_POSTAMBLE, true)
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            warn!(error = %e, "Postamble not acknowledged");
        }

        self.transport.close(reset);
        self.goto_state(EngineState::Closed);
        self.emit(UploadEvent::DeviceClosed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::probe::tests::{header, record32};
    use crate::transport::{MockRead, MockTransport};

    fn engine(mock: MockTransport) -> UploadProtocol<MockTransport, NullObserver> {
        UploadProtocol::new(mock, Arc::new(NullObserver), EngineOptions::default())
    }

    /// Engine past the handshake, with only `mock`'s script queued.
    fn ready_engine(mock: MockTransport) -> UploadProtocol<MockTransport, NullObserver> {
        let mut engine = engine(mock);
        engine.state = EngineState::Ready;
        engine
    }

    fn queue_range_setup(mock: &mut MockTransport) {
        for _ in 0..3 {
            mock.queue_token(CMD_ACKNOWLEDGMENT);
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_handshake() {
        let mut mock = MockTransport::new();
        mock.queue_token(CMD_ACKNOWLEDGMENT);
        let mut engine = engine(mock);

        engine.handshake().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.transport().writes(), &[b"PrEaMbLe\0".to_vec()]);
    }

    #[test]
    fn test_handshake_mismatch() {
        let mut mock = MockTransport::new();
        mock.queue_data(b"HELLO\0");
        let mut engine = engine(mock);

        let err = engine.handshake().unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolMismatch { .. }));
        assert_eq!(engine.state(), EngineState::ProtocolMismatch);
        assert!(engine.state().is_terminal());
        assert!(engine.probe().is_err());
    }

    #[test]
    fn test_handshake_timeout_is_mismatch() {
        let mut engine = engine(MockTransport::new());
        assert!(matches!(
            engine.handshake(),
            Err(ProtocolError::ProtocolMismatch {
                response: Response::Empty
            })
        ));
    }

    #[test]
    fn test_probe_sets_mode() {
        let mut mock = MockTransport::new();
        mock.queue_token(CMD_ACKNOWLEDGMENT);
        let mut table = header("+MODEM");
        table.extend_from_slice(&[0u8; 0x28]);
        mock.queue_data(&table);
        let mut engine = engine(mock);

        engine.handshake().unwrap();
        let probed = engine.probe().unwrap();
        assert_eq!(probed.device_name, "MODEM");
        assert_eq!(engine.address_mode(), AddressMode::Bits64);
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.transport().written_tokens(), vec!["PrEaMbLe", "PrObE"]);
    }

    #[test]
    fn test_probe_malformed_returns_to_ready() {
        let mut mock = MockTransport::new();
        mock.queue_token(CMD_ACKNOWLEDGMENT);
        let mut table = header("TEST");
        record32(&mut table, 1, "BOOT", 0x100, 0x1FF);
        table.truncate(table.len() - 3);
        mock.queue_data(&table);
        let mut engine = engine(mock);

        engine.handshake().unwrap();
        assert!(matches!(
            engine.probe(),
            Err(ProtocolError::Probe(ProbeError::Truncated { .. }))
        ));
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_command_rejects_other_response() {
        let mut mock = MockTransport::new();
        mock.queue_data(b"NoPe\0");
        let mut engine = ready_engine(mock);

        let err = engine.command(b"00000100", true).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_download_range_exact_bytes() {
        let data = pattern(0x505);
        let range = TransferRange::new(0x100, 0x100 + data.len() as u64 - 1).unwrap();

        let mut mock = MockTransport::new();
        mock.queue_token(CMD_ACKNOWLEDGMENT);
        queue_range_setup(&mut mock);
        mock.queue_data(&data[..1024]);
        mock.queue_timeout();
        mock.queue_data(&data[1024..]);
        mock.queue_token(CMD_POSTAMBLE);
        let mut engine = engine(mock);
        engine.handshake().unwrap();

        let mut sink = Vec::new();
        let n = engine.download_range(range, &mut sink, "range.bin").unwrap();
        assert_eq!(n, range.len());
        assert_eq!(sink, data);
        assert_eq!(engine.state(), EngineState::Ready);

        let tokens = engine.transport().written_tokens();
        assert_eq!(
            &tokens[..5],
            &["PrEaMbLe", "PrEaMbLe", "00000100", "00000604", "DaTaXfEr"]
        );
        assert!(tokens[5..].iter().all(|t| t == "AcKnOwLeDgMeNt"));
        assert_eq!(engine.transport().pending_reads(), 0);
    }

    #[test]
    fn test_download_range_64bit_encoding() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[0xAA; 16]);
        mock.queue_token(CMD_POSTAMBLE);
        let mut engine = ready_engine(mock);
        engine.set_address_mode(AddressMode::Bits64);

        let range = TransferRange::new(0x1_0000_0000, 0x1_0000_000F).unwrap();
        let mut sink = Vec::new();
        engine.download_range(range, &mut sink, "x").unwrap();

        let tokens = engine.transport().written_tokens();
        assert_eq!(tokens[1], "0000000100000000");
        assert_eq!(tokens[2], "000000010000000f");
    }

    #[test]
    fn test_download_stalls_after_empty_reads() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[1, 2, 3, 4]);
        mock.queue_timeout();
        mock.queue_timeout();
        mock.queue_timeout();
        mock.queue_data(&[5, 6, 7, 8]);
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let err = engine
            .download_range(TransferRange::new(0x100, 0x107).unwrap(), &mut sink, "x")
            .unwrap_err();
        match err {
            ProtocolError::TransferStalled {
                received,
                empty_reads,
                ..
            } => {
                assert_eq!(received, 4);
                assert_eq!(empty_reads, 3);
            }
            other => panic!("expected stall, got {:?}", other),
        }
        assert_eq!(sink, vec![1, 2, 3, 4]);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_download_setup_failure() {
        let mut mock = MockTransport::new();
        mock.queue_token(CMD_ACKNOWLEDGMENT);
        mock.queue_data(b"BAD\0");
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let err = engine
            .download_range(TransferRange::new(0x100, 0x1FF).unwrap(), &mut sink, "x")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RangeSetupFailed { .. }));
        assert!(sink.is_empty());
        // Setup stopped at the start boundary; DaTaXfEr never sent.
        assert!(
            !engine
                .transport()
                .written_tokens()
                .contains(&"DaTaXfEr".to_string())
        );
    }

    #[test]
    fn test_download_missing_postamble_keeps_data() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[9; 32]);
        mock.queue_data(b"garbage\0");
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let err = engine
            .download_range(TransferRange::new(0x100, 0x11F).unwrap(), &mut sink, "x")
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IncompleteTransfer {
                received: 32,
                expected: 32,
                ..
            }
        ));
        assert_eq!(sink, vec![9; 32]);
    }

    #[test]
    fn test_download_transport_fault_reports_range() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[7; 8]);
        mock.queue(MockRead::Overflow);
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let range = TransferRange::new(0x100, 0x1FF).unwrap();
        let err = engine.download_range(range, &mut sink, "x").unwrap_err();
        match err {
            ProtocolError::TransferFault {
                range: failed,
                received,
                source,
            } => {
                assert_eq!(failed, range);
                assert_eq!(received, 8);
                assert_eq!(source, TransportError::Overflow);
            }
            other => panic!("expected transport fault, got {:?}", other),
        }
        assert_eq!(sink.len(), 8);
    }

    #[test]
    fn test_download_excess_holds_postamble() {
        let mut mock = MockTransport::new().with_packet_size(64);
        queue_range_setup(&mut mock);
        let mut packet = vec![3u8; 8];
        packet.extend_from_slice(b"PoStAmBlE\0");
        mock.queue_data(&packet);
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let n = engine
            .download_range(TransferRange::new(0x100, 0x107).unwrap(), &mut sink, "x")
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(sink, vec![3u8; 8]);
    }

    #[test]
    fn test_download_rejects_wide_address_in_32bit_mode() {
        let mut engine = ready_engine(MockTransport::new());
        let mut sink = Vec::new();
        let err = engine
            .download_range(
                TransferRange::new(0x1_0000_0000, 0x1_0000_0001).unwrap(),
                &mut sink,
                "x",
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Address(_)));
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.transport().written_tokens().is_empty());
    }

    #[test]
    fn test_close_sends_postamble() {
        let mut mock = MockTransport::new();
        mock.queue_token(CMD_POSTAMBLE);
        let mut engine = ready_engine(mock);

        engine.close(false).unwrap();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine.state().is_terminal());
        assert!(!engine.transport().is_connected());
        assert_eq!(engine.transport().written_tokens(), vec!["PoStAmBlE"]);
        // Closing twice is a no-op.
        engine.close(false).unwrap();
    }

    #[test]
    fn test_close_without_ack_still_releases() {
        let mut engine = ready_engine(MockTransport::new());
        assert!(engine.close(true).is_err());
        assert!(engine.transport().reset_requested());
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[test]
    fn test_chunk_kept_when_ack_write_fails() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[5; 8]);
        // PrEaMbLe, start, end and DaTaXfEr go through; the ACK does not.
        mock.fail_writes_after(4, TransportError::Fault("pipe".into()));
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let err = engine
            .download_range(TransferRange::new(0x100, 0x10F).unwrap(), &mut sink, "x")
            .unwrap_err();
        match err {
            ProtocolError::TransferFault {
                received, source, ..
            } => {
                assert_eq!(received, 8);
                assert!(matches!(source, TransportError::WriteFailed { attempts: 3, .. }));
            }
            other => panic!("expected transport fault, got {:?}", other),
        }
        assert_eq!(sink, vec![5; 8]);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_disconnect_mid_transfer() {
        let mut mock = MockTransport::new();
        queue_range_setup(&mut mock);
        mock.queue_data(&[6; 4]);
        mock.queue(MockRead::Disconnect);
        let mut engine = ready_engine(mock);

        let mut sink = Vec::new();
        let err = engine
            .download_range(TransferRange::new(0x100, 0x10F).unwrap(), &mut sink, "x")
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TransferFault {
                received: 4,
                source: TransportError::Disconnected,
                ..
            }
        ));
        assert_eq!(sink, vec![6; 4]);
        assert!(!engine.transport().is_connected());
    }

    #[test]
    fn test_legacy_unpadded_64bit_only() {
        let mut mock = MockTransport::new();
        for _ in 0..2 {
            queue_range_setup(&mut mock);
            mock.queue_data(&[0; 2]);
            mock.queue_token(CMD_POSTAMBLE);
        }
        let options = EngineOptions {
            padding: AddressPadding {
                bits32: true,
                bits64: false,
            },
            ..Default::default()
        };
        let mut engine = UploadProtocol::new(mock, Arc::new(NullObserver), options);
        engine.state = EngineState::Ready;
        let range = TransferRange::new(0x100, 0x101).unwrap();
        let mut sink = Vec::new();

        engine.download_range(range, &mut sink, "x").unwrap();
        assert_eq!(&engine.transport().written_tokens()[1..3], &["00000100", "00000101"]);

        engine.transport.clear_writes();
        engine.set_address_mode(AddressMode::Bits64);
        engine.download_range(range, &mut sink, "x").unwrap();
        assert_eq!(&engine.transport().written_tokens()[1..3], &["100", "101"]);
    }
}
