//! maskrom-core: host-side driver for the Rockchip maskrom USB boot agent.
//!
//! Rockchip application processors expose a minimal ROM-resident loader
//! over USB before any firmware exists on the device. This crate speaks
//! its protocol: enumerate candidates, push boot images into on-chip RAM,
//! and issue storage and diagnostic commands.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: frame codec, command catalog, typed reply decodes
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Session**: the three-stage command/data/status exchange and its
//!   failure classification, plus windowed bulk reads
//! - **Loader**: boot-image preparation (pad, obfuscate, checksum) and
//!   chunked control-transfer delivery
//! - **Idb**: best-effort scanner for on-media Initial Data Blocks
//! - **Device**: typed facade over one opened device
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use maskrom_core::MaskromDevice;
//!
//! let device = MaskromDevice::open(0, Duration::from_millis(1000))?;
//! println!("{}", device.read_chip_info()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batch;
pub mod crc;
pub mod device;
pub mod idb;
pub mod loader;
pub mod protocol;
pub mod rc4;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use crc::crc16;
pub use device::MaskromDevice;
pub use idb::{HashKind, IdbEntry, IdbError, IdbHeader, IdbScanner, RecoveredIdb};
pub use loader::{RamTarget, load_to_ram, prepare_image};
pub use protocol::{Capability, ChipInfo, FlashId, FlashInfo, Opcode, Operation, Reply};
pub use rc4::Rc4;
pub use session::{Session, SessionConfig, SessionError};
pub use transport::{
    MaskromDeviceInfo, MockTransport, NusbTransport, TransportError, UsbTransport,
    list_maskrom_devices,
};
