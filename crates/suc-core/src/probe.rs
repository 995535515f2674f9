//! Probe table codec.
//!
//! The `PrObE` response is a device name field followed by fixed-stride
//! partition records starting at offset 0x10. A `+` in front of the device
//! name selects the 64-bit record layout.
//!
//! ```text
//! 32-bit record (0x1C): type:u32 | name:[u8; 16] | start:u32 | end:u32
//! 64-bit record (0x28): type:u32 | name:[u8; 12] | info:u64 | start:u64 | end:u64
//! ```
//!
//! All integers are little-endian.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::protocol::address::{AddressError, AddressMode, TransferRange};
use crate::protocol::constants::{
    DEFAULT_MIN_RECORD_START, PROBE_64BIT_MARKER, PROBE_HEADER_SIZE, RECORD_NAME_LEN_32,
    RECORD_NAME_LEN_64, RECORD_SIZE_32, RECORD_SIZE_64,
};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe response is empty")]
    Empty,
    #[error("Probe table truncated at offset 0x{offset:X}: need {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One addressable region reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub record_type: u32,
    pub name: String,
    /// Reserved field of the 64-bit layout, zero for 32-bit records.
    pub info: u64,
    pub start: u64,
    pub end: u64,
}

impl PartitionRecord {
    /// Byte range covered by this record.
    pub fn range(&self) -> Result<TransferRange, AddressError> {
        TransferRange::new(self.start, self.end)
    }

    /// Output file name for this record.
    ///
    /// Names carrying an extension are used as-is; others get the address
    /// range appended, e.g. `BOOT_100_1ff.lst`. The result is always a single
    /// path component.
    pub fn file_name(&self) -> String {
        let name = path_component(&self.name);
        if name.is_empty() {
            format!("{:x}_{:x}.lst", self.start, self.end)
        } else if name.contains('.') {
            name
        } else {
            format!("{}_{:x}_{:x}.lst", name, self.start, self.end)
        }
    }

    fn parse(cursor: &mut Cursor<&[u8]>, mode: AddressMode) -> Result<Self, ProbeError> {
        let record_type = cursor.read_u32::<LittleEndian>()?;
        match mode {
            AddressMode::Bits32 => {
                let mut name = [0u8; RECORD_NAME_LEN_32];
                cursor.read_exact(&mut name)?;
                Ok(Self {
                    record_type,
                    name: nul_terminated(&name),
                    info: 0,
                    start: cursor.read_u32::<LittleEndian>()? as u64,
                    end: cursor.read_u32::<LittleEndian>()? as u64,
                })
            }
            AddressMode::Bits64 => {
                let mut name = [0u8; RECORD_NAME_LEN_64];
                cursor.read_exact(&mut name)?;
                Ok(Self {
                    record_type,
                    name: nul_terminated(&name),
                    info: cursor.read_u64::<LittleEndian>()?,
                    start: cursor.read_u64::<LittleEndian>()?,
                    end: cursor.read_u64::<LittleEndian>()?,
                })
            }
        }
    }
}

impl fmt::Display for PartitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" (0x{:x},0x{:x})", self.name, self.start, self.end)
    }
}

/// Decoded `PrObE` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTable {
    pub mode: AddressMode,
    pub device_name: String,
    pub records: Vec<PartitionRecord>,
}

impl ProbeTable {
    pub fn get(&self, index: usize) -> Option<&PartitionRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl fmt::Display for ProbeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Probed device:")?;
        writeln!(f, "---------------")?;
        writeln!(f, "{}, Devicename: \"{}\"", self.mode, self.device_name)?;
        writeln!(f)?;
        writeln!(f, "Detected upload areas:")?;
        writeln!(f, "---------------------")?;
        for (index, record) in self.records.iter().enumerate() {
            writeln!(f, "{}: {}", index, record)?;
        }
        Ok(())
    }
}

/// Flatten a device-supplied name into one file name component.
///
/// Separators, drive colons and control characters become `_`, as does every
/// `..`. A lone `.` yields an empty string.
fn path_component(name: &str) -> String {
    let flat: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let flat = flat.replace("..", "_");
    if flat == "." { String::new() } else { flat }
}

/// Decode a probe response with the default end-of-table threshold.
pub fn decode(raw: &[u8]) -> Result<ProbeTable, ProbeError> {
    decode_with_threshold(raw, DEFAULT_MIN_RECORD_START)
}

/// Decode a probe response.
///
/// Parsing stops at the first record whose start and end are both zero, or
/// whose start is below `min_start`. A buffer ending inside a record is an
/// error; a buffer ending exactly on a record boundary is not.
pub fn decode_with_threshold(raw: &[u8], min_start: u64) -> Result<ProbeTable, ProbeError> {
    if raw.is_empty() {
        return Err(ProbeError::Empty);
    }
    if raw.len() < PROBE_HEADER_SIZE {
        return Err(ProbeError::Truncated {
            offset: 0,
            needed: PROBE_HEADER_SIZE,
            available: raw.len(),
        });
    }

    let name = nul_terminated(&raw[..PROBE_HEADER_SIZE]);
    let (mode, device_name) = match name.strip_prefix(PROBE_64BIT_MARKER as char) {
        Some(stripped) => (AddressMode::Bits64, stripped.to_string()),
        None => (AddressMode::Bits32, name),
    };
    let stride = match mode {
        AddressMode::Bits32 => RECORD_SIZE_32,
        AddressMode::Bits64 => RECORD_SIZE_64,
    };

    let mut records = Vec::new();
    let mut offset = PROBE_HEADER_SIZE;
    while offset < raw.len() {
        let available = raw.len() - offset;
        if available < stride {
            return Err(ProbeError::Truncated {
                offset,
                needed: stride,
                available,
            });
        }

        let mut cursor = Cursor::new(&raw[offset..offset + stride]);
        let record = PartitionRecord::parse(&mut cursor, mode)?;
        if (record.start == 0 && record.end == 0) || record.start < min_start {
            break;
        }
        records.push(record);
        offset += stride;
    }

    tracing::debug!(
        mode = %mode,
        device = %device_name,
        records = records.len(),
        "Decoded probe table"
    );

    Ok(ProbeTable {
        mode,
        device_name,
        records,
    })
}

/// Text up to the first NUL; the whole field if there is none.
fn nul_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
