//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::{MaskromDeviceInfo, NusbTransport, list_maskrom_devices};
pub use traits::{TransportError, UsbTransport};
