//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use self::mock::{MockRead, MockTransport};
pub use self::nusb::{AttachedDevice, NusbTransport};
pub use self::traits::{
    DeviceAddress, EndpointDirection, EndpointInfo, InterfaceInfo, TransportError,
    TransportOptions, UsbTransport,
};
