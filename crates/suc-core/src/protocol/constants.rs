//! Protocol constants for the modem upload-mode protocol.
//!
//! Tokens are plain ASCII and travel NUL-terminated in both directions.

// ============================================================================
// Device Identification
// ============================================================================

/// Samsung Electronics Vendor ID
pub const SAMSUNG_VENDOR_ID: u16 = 0x04E8;

/// Modem in upload (memory dump) mode
pub const MODEM_UPLOAD_PRODUCT_ID: u16 = 0x685D;

/// CDC Data interface class, carries the bulk pipe in upload mode
pub const CDC_DATA_CLASS: u8 = 0x0A;

// ============================================================================
// Commands and Responses
// ============================================================================

/// Begin handshake / begin range setup (host -> device)
pub const CMD_PREAMBLE: &[u8] = b"PrEaMbLe";

/// Generic acknowledgment (device -> host) and chunk-continue (host -> device)
pub const CMD_ACKNOWLEDGMENT: &[u8] = b"AcKnOwLeDgMeNt";

/// Request partition table (host -> device)
pub const CMD_PROBE: &[u8] = b"PrObE";

/// Start streaming the configured range (host -> device)
pub const CMD_DATA_TRANSFER: &[u8] = b"DaTaXfEr";

/// End of range transfer or end of session (both directions)
pub const CMD_POSTAMBLE: &[u8] = b"PoStAmBlE";

/// Terminator appended to every command on the wire
pub const TOKEN_TERMINATOR: u8 = 0x00;

// ============================================================================
// Probe Table Layout
// ============================================================================

/// Offset of the first record, past the device name field
pub const PROBE_HEADER_SIZE: usize = 0x10;

/// Device name prefix selecting 64-bit records
pub const PROBE_64BIT_MARKER: u8 = b'+';

/// 32-bit record: type(4) + name(16) + start(4) + end(4)
pub const RECORD_SIZE_32: usize = 0x1C;
pub const RECORD_NAME_LEN_32: usize = 16;

/// 64-bit record: type(4) + name(12) + info(8) + start(8) + end(8)
pub const RECORD_SIZE_64: usize = 0x28;
pub const RECORD_NAME_LEN_64: usize = 12;

/// Records starting below this offset end the table.
///
/// Empirical value, overridable through the session configuration.
pub const DEFAULT_MIN_RECORD_START: u64 = 20;

// ============================================================================
// Transfer Limits
// ============================================================================

/// Upper bound for a single probe response
pub const PROBE_MAX_LEN: usize = 0x8000;

/// Read size for the trailing postamble after a range
pub const POSTAMBLE_READ_LEN: usize = 64;

/// Default bulk I/O timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Consecutive empty reads tolerated during a range download
pub const DEFAULT_STALL_LIMIT: u32 = 3;

/// Consecutive failed writes before a chunked write is abandoned
pub const WRITE_RETRY_LIMIT: u32 = 3;

/// Fallback packet size when an endpoint override has no descriptor
pub const DEFAULT_MAX_PACKET_SIZE: usize = 0x200;

/// Progress is reported in sectors of this size
pub const DEFAULT_PAGE_SIZE: u64 = 512;

/// Highest address requested by a full dump in 32-bit mode
pub const FULL_DUMP_END_32: u64 = 0xFFFF_FFFF;

/// Highest address requested by a full dump in 64-bit mode
pub const FULL_DUMP_END_64: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// First address requested by a full dump
pub const FULL_DUMP_START: u64 = 1;
