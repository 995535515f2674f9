//! Address modes and range boundary encoding.
//!
//! Range boundaries are sent as lower-case ASCII hex without a `0x` prefix.
//! The width is fixed per address mode (8 or 16 digits) unless the legacy
//! unpadded encoding is selected for that mode. One encoding is used for a
//! whole session.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::{FULL_DUMP_END_32, FULL_DUMP_END_64, FULL_DUMP_START};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid hex address: {0:?}")]
    InvalidHex(String),
    #[error("Address 0x{value:X} does not fit in {mode}")]
    OutOfRange { value: u64, mode: AddressMode },
    #[error("Inverted range: start 0x{start:X} > end 0x{end:X}")]
    Inverted { start: u64, end: u64 },
}

/// Width of partition offsets reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Bits32,
    Bits64,
}

impl AddressMode {
    /// Number of address bits.
    pub fn bits(&self) -> u32 {
        match self {
            AddressMode::Bits32 => 32,
            AddressMode::Bits64 => 64,
        }
    }

    /// Digits in the zero-padded encoding.
    pub fn hex_width(&self) -> usize {
        match self {
            AddressMode::Bits32 => 8,
            AddressMode::Bits64 => 16,
        }
    }

    /// Largest address representable in this mode.
    pub fn max_address(&self) -> u64 {
        match self {
            AddressMode::Bits32 => u32::MAX as u64,
            AddressMode::Bits64 => u64::MAX,
        }
    }

    /// Range requested by a full address-space dump.
    pub fn full_range(&self) -> TransferRange {
        let end = match self {
            AddressMode::Bits32 => FULL_DUMP_END_32,
            AddressMode::Bits64 => FULL_DUMP_END_64,
        };
        TransferRange {
            start: FULL_DUMP_START,
            end,
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-Bit", self.bits())
    }
}

/// Zero-padding choice per address mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPadding {
    pub bits32: bool,
    pub bits64: bool,
}

impl AddressPadding {
    /// Same choice for both modes.
    pub fn uniform(padded: bool) -> Self {
        Self {
            bits32: padded,
            bits64: padded,
        }
    }

    pub fn for_mode(&self, mode: AddressMode) -> bool {
        match mode {
            AddressMode::Bits32 => self.bits32,
            AddressMode::Bits64 => self.bits64,
        }
    }
}

impl Default for AddressPadding {
    fn default() -> Self {
        Self::uniform(true)
    }
}

/// Encoding of range boundaries for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEncoding {
    pub mode: AddressMode,
    /// Unpadded is the legacy form, chosen per mode.
    pub padding: AddressPadding,
}

impl AddressEncoding {
    pub fn new(mode: AddressMode, padding: AddressPadding) -> Self {
        Self { mode, padding }
    }

    /// Whether boundaries are zero-padded in the current mode.
    pub fn padded(&self) -> bool {
        self.padding.for_mode(self.mode)
    }

    /// Format one boundary as ASCII hex.
    pub fn format(&self, value: u64) -> Result<String, AddressError> {
        if value > self.mode.max_address() {
            return Err(AddressError::OutOfRange {
                value,
                mode: self.mode,
            });
        }
        Ok(if self.padded() {
            format!("{:0width$x}", value, width = self.mode.hex_width())
        } else {
            format!("{:x}", value)
        })
    }

    /// Parse a boundary produced by [`AddressEncoding::format`].
    pub fn parse(&self, text: &str) -> Result<u64, AddressError> {
        let value = parse_hex(text)?;
        if value > self.mode.max_address() {
            return Err(AddressError::OutOfRange {
                value,
                mode: self.mode,
            });
        }
        Ok(value)
    }
}

impl Default for AddressEncoding {
    fn default() -> Self {
        Self::new(AddressMode::Bits32, AddressPadding::default())
    }
}

/// Parse hex text, accepting an optional `0x`/`0X` prefix.
pub fn parse_hex(text: &str) -> Result<u64, AddressError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(AddressError::InvalidHex(text.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| AddressError::InvalidHex(text.to_string()))
}

/// Inclusive byte range on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRange {
    pub start: u64,
    pub end: u64,
}

impl TransferRange {
    pub fn new(start: u64, end: u64) -> Result<Self, AddressError> {
        if start > end {
            return Err(AddressError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered, `end - start + 1`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for TransferRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}..=0x{:X}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_padded_widths() {
        let enc32 = AddressEncoding::new(AddressMode::Bits32, AddressPadding::default());
        assert_eq!(enc32.format(0x100).unwrap(), "00000100");
        assert_eq!(enc32.format(0xABCDEF01).unwrap(), "abcdef01");

        let enc64 = AddressEncoding::new(AddressMode::Bits64, AddressPadding::default());
        assert_eq!(enc64.format(0x1FF).unwrap(), "00000000000001ff");
    }

    #[test]
    fn test_unpadded_legacy() {
        let enc = AddressEncoding::new(AddressMode::Bits64, AddressPadding::uniform(false));
        assert_eq!(enc.format(0x1FF).unwrap(), "1ff");
    }

    #[test]
    fn test_padding_chosen_per_mode() {
        let padding = AddressPadding {
            bits32: true,
            bits64: false,
        };
        let mut enc = AddressEncoding::new(AddressMode::Bits32, padding);
        assert!(enc.padded());
        assert_eq!(enc.format(0x1FF).unwrap(), "000001ff");

        enc.mode = AddressMode::Bits64;
        assert!(!enc.padded());
        assert_eq!(enc.format(0x1FF).unwrap(), "1ff");
    }

    #[test]
    fn test_32bit_rejects_wide_address() {
        let enc = AddressEncoding::new(AddressMode::Bits32, AddressPadding::default());
        assert_eq!(
            enc.format(0x1_0000_0000),
            Err(AddressError::OutOfRange {
                value: 0x1_0000_0000,
                mode: AddressMode::Bits32
            })
        );
    }

    #[test]
    fn test_parse_hex_prefix() {
        assert_eq!(parse_hex("0x1ff").unwrap(), 0x1FF);
        assert_eq!(parse_hex("1FF").unwrap(), 0x1FF);
        assert!(parse_hex("0x").is_err());
        assert!(parse_hex("xyz").is_err());
    }

    #[test]
    fn test_range_len() {
        let range = TransferRange::new(0x100, 0x1FF).unwrap();
        assert_eq!(range.len(), 0x100);
        assert!(TransferRange::new(2, 1).is_err());
        assert_eq!(TransferRange::new(0, u64::MAX).unwrap().len(), u64::MAX);
    }

    #[test]
    fn test_full_range() {
        assert_eq!(AddressMode::Bits32.full_range().end, 0xFFFF_FFFF);
        assert_eq!(AddressMode::Bits64.full_range().start, 1);
    }

    proptest! {
        #[test]
        fn prop_format_roundtrip_32(value in 0u64..=u32::MAX as u64, padded in any::<bool>()) {
            let enc = AddressEncoding::new(AddressMode::Bits32, AddressPadding::uniform(padded));
            let text = enc.format(value).unwrap();
            if padded {
                prop_assert_eq!(text.len(), 8);
            }
            prop_assert_eq!(enc.parse(&text).unwrap(), value);
        }

        #[test]
        fn prop_format_roundtrip_64(value in any::<u64>(), padded in any::<bool>()) {
            let enc = AddressEncoding::new(AddressMode::Bits64, AddressPadding::uniform(padded));
            let text = enc.format(value).unwrap();
            if padded {
                prop_assert_eq!(text.len(), 16);
            }
            prop_assert!(text.chars().all(|c| !c.is_ascii_uppercase()));
            prop_assert_eq!(enc.parse(&text).unwrap(), value);
        }
    }
}
