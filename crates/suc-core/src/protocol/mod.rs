//! Protocol module - upload-mode wire definitions.

pub mod address;
pub mod constants;
pub mod token;

pub use address::{
    AddressEncoding, AddressError, AddressMode, AddressPadding, TransferRange, parse_hex,
};
pub use constants::*;
pub use token::Response;
