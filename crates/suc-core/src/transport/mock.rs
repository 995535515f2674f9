//! Mock USB transport for testing.
//!
//! Reads are scripted: each queued item is consumed by one or more
//! `read_packet` calls. Data longer than the requested packet is handed out
//! packet by packet, like a device streaming a large buffer.

use std::collections::VecDeque;

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_TIMEOUT_MS};
use crate::protocol::token::terminated;

/// One scripted device reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    Timeout,
    Overflow,
    Fault(String),
    Disconnect,
}

/// Mock transport for unit testing protocol logic.
pub struct MockTransport {
    /// Queued device reactions, consumed front to back.
    reads: VecDeque<MockRead>,
    /// Captured OUT packets.
    writes: Vec<Vec<u8>>,
    /// Errors returned by the next OUT packets instead of accepting them.
    write_errors: VecDeque<TransportError>,
    /// OUT packets still accepted before every write fails with the error.
    write_limit: Option<(usize, TransportError)>,
    in_packet_size: usize,
    out_packet_size: usize,
    vid: u16,
    pid: u16,
    connected: bool,
    /// Set when `close(true)` was called.
    reset_requested: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: Vec::new(),
            write_errors: VecDeque::new(),
            write_limit: None,
            in_packet_size: DEFAULT_MAX_PACKET_SIZE,
            out_packet_size: DEFAULT_MAX_PACKET_SIZE,
            vid: 0x04E8,
            pid: 0x685D,
            connected: true,
            reset_requested: false,
        }
    }

    /// Use a different max packet size on both endpoints.
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.in_packet_size = size;
        self.out_packet_size = size;
        self
    }

    /// Queue raw bytes to be returned on read.
    pub fn queue_data(&mut self, data: &[u8]) {
        self.reads.push_back(MockRead::Data(data.to_vec()));
    }

    /// Queue a NUL-terminated token such as `AcKnOwLeDgMeNt`.
    pub fn queue_token(&mut self, token: &[u8]) {
        self.reads.push_back(MockRead::Data(terminated(token)));
    }

    /// Queue a read that times out with no data.
    pub fn queue_timeout(&mut self) {
        self.reads.push_back(MockRead::Timeout);
    }

    pub fn queue(&mut self, read: MockRead) {
        self.reads.push_back(read);
    }

    /// Fail the next OUT packet with `error`.
    pub fn fail_next_write(&mut self, error: TransportError) {
        self.write_errors.push_back(error);
    }

    /// Accept `count` more OUT packets, then fail every write with `error`.
    pub fn fail_writes_after(&mut self, count: usize, error: TransportError) {
        self.write_limit = Some((count, error));
    }

    /// Get all captured OUT packets.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Captured OUT packets as text, terminator stripped.
    pub fn written_tokens(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|w| {
                let end = w.iter().position(|&b| b == 0).unwrap_or(w.len());
                String::from_utf8_lossy(&w[..end]).into_owned()
            })
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Scripted reads not consumed yet.
    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Set VID/PID.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write_packet(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = self.write_errors.pop_front() {
            return Err(error);
        }
        if let Some((remaining, error)) = &mut self.write_limit {
            if *remaining == 0 {
                return Err(error.clone());
            }
            *remaining -= 1;
        }
        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_packet(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.reads.pop_front() {
            None | Some(MockRead::Timeout) => Err(TransportError::Timeout {
                timeout_ms: DEFAULT_TIMEOUT_MS,
            }),
            Some(MockRead::Data(mut data)) => {
                if data.len() > len {
                    let rest = data.split_off(len);
                    self.reads.push_front(MockRead::Data(rest));
                }
                Ok(data)
            }
            Some(MockRead::Overflow) => Err(TransportError::Overflow),
            Some(MockRead::Fault(message)) => Err(TransportError::Fault(message)),
            Some(MockRead::Disconnect) => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    fn out_packet_size(&self) -> usize {
        self.out_packet_size
    }

    fn in_packet_size(&self) -> usize {
        self.in_packet_size
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn close(&mut self, reset: bool) {
        self.reset_requested |= reset;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_splits_into_packets() {
        let mut mock = MockTransport::new().with_packet_size(4);
        mock.write(b"PrEaMbLe\0").unwrap();
        assert_eq!(
            mock.writes(),
            &[b"PrEa".to_vec(), b"MbLe".to_vec(), b"\0".to_vec()]
        );
    }

    #[test]
    fn test_write_retries_then_gives_up() {
        let mut mock = MockTransport::new();
        mock.fail_next_write(TransportError::Fault("pipe".into()));
        mock.write(b"PrObE\0").unwrap();
        assert_eq!(mock.written_tokens(), vec!["PrObE"]);

        for _ in 0..3 {
            mock.fail_next_write(TransportError::Fault("pipe".into()));
        }
        assert!(matches!(
            mock.write(b"PrObE\0"),
            Err(TransportError::WriteFailed { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_zero_length_write_timeout_is_tolerated() {
        let timeout = TransportError::Timeout { timeout_ms: 1000 };
        let mut mock = MockTransport::new();
        mock.fail_next_write(timeout.clone());
        mock.fail_next_write(timeout.clone());
        mock.write(&[]).unwrap();
        assert!(mock.writes().is_empty());

        mock.fail_next_write(timeout);
        mock.write(&[]).unwrap();
        assert_eq!(mock.writes(), &[Vec::<u8>::new()]);

        mock.fail_next_write(TransportError::Disconnected);
        assert_eq!(mock.write(&[]), Err(TransportError::Disconnected));
    }

    #[test]
    fn test_read_stops_on_short_packet() {
        let mut mock = MockTransport::new().with_packet_size(4);
        mock.queue_data(b"abcdefgh");
        mock.queue_data(b"ij");
        mock.queue_data(b"kl");
        assert_eq!(mock.read(None).unwrap(), b"abcdefghij".to_vec());
        assert_eq!(mock.read(None).unwrap(), b"kl".to_vec());
    }

    #[test]
    fn test_read_respects_limit() {
        let mut mock = MockTransport::new().with_packet_size(4);
        mock.queue_data(b"abcdefghijkl");
        assert_eq!(mock.read(Some(8)).unwrap(), b"abcdefgh".to_vec());
        assert_eq!(mock.pending_reads(), 1);
    }

    #[test]
    fn test_read_timeout_returns_partial() {
        let mut mock = MockTransport::new().with_packet_size(4);
        mock.queue_data(b"abcd");
        mock.queue_timeout();
        assert_eq!(mock.read(None).unwrap(), b"abcd".to_vec());
        assert!(mock.read(None).unwrap().is_empty());
    }

    #[test]
    fn test_read_overflow_and_fault() {
        let mut mock = MockTransport::new();
        mock.queue(MockRead::Overflow);
        mock.queue(MockRead::Fault("babble".into()));
        assert_eq!(mock.read(None), Err(TransportError::Overflow));
        assert!(matches!(mock.read(None), Err(TransportError::Fault(_))));
    }

    #[test]
    fn test_writes_fail_after_limit() {
        let mut mock = MockTransport::new();
        mock.fail_writes_after(1, TransportError::Disconnected);
        mock.write(b"PrEaMbLe\0").unwrap();
        assert!(mock.write(b"PrObE\0").is_err());
        assert_eq!(mock.written_tokens(), vec!["PrEaMbLe"]);
    }

    #[test]
    fn test_close_disconnects() {
        let mut mock = MockTransport::new();
        mock.close(true);
        assert!(!mock.is_connected());
        assert!(mock.reset_requested());
        assert_eq!(mock.write(b"x"), Err(TransportError::NotConnected));
    }
}
