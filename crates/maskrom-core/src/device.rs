//! High-level maskrom device handle.
//!
//! Wraps a session with typed operations so callers never touch opcodes or
//! frames. One `MaskromDevice` per physical device; it is safe to drive
//! devices from different threads as long as each handle stays on one
//! thread at a time.

use std::time::Duration;

use tracing::instrument;

use crate::loader::{RamTarget, load_to_ram};
use crate::protocol::command::Operation;
use crate::protocol::reply::Reply;
use crate::session::{BatchedRead, Session, SessionConfig, SessionError};
use crate::transport::{NusbTransport, TransportError, UsbTransport};

/// One opened maskrom-mode device.
pub struct MaskromDevice<T: UsbTransport = NusbTransport> {
    session: Session<T>,
    encrypt: bool,
}

impl MaskromDevice<NusbTransport> {
    /// Open the `index`-th maskrom device on the bus.
    #[instrument(level = "info")]
    pub fn open(index: usize, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            session: Session::new(NusbTransport::open(index)?, timeout),
            encrypt: true,
        })
    }

    /// Open per a session config.
    pub fn open_with_config(config: &SessionConfig) -> Result<Self, TransportError> {
        let mut device = Self::open(config.device_index, config.timeout())?;
        device.encrypt = config.encrypt;
        Ok(device)
    }
}

impl<T: UsbTransport> MaskromDevice<T> {
    /// Wrap an already-opened transport.
    pub fn from_transport(transport: T, timeout: Duration) -> Self {
        Self {
            session: Session::new(transport, timeout),
            encrypt: true,
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Probe whether the boot agent answers commands at all.
    pub fn test_unit_ready(&self) -> Result<Reply, SessionError> {
        self.session.execute(Operation::TestUnitReady)
    }

    pub fn read_flash_id(&self) -> Result<Reply, SessionError> {
        self.session.execute(Operation::ReadFlashId)
    }

    pub fn read_flash_info(&self) -> Result<Reply, SessionError> {
        self.session.execute(Operation::ReadFlashInfo)
    }

    pub fn read_chip_info(&self) -> Result<Reply, SessionError> {
        self.session.execute(Operation::ReadChipInfo)
    }

    pub fn read_capability(&self) -> Result<Reply, SessionError> {
        self.session.execute(Operation::ReadCapability)
    }

    /// Ask the agent to reset. The device drops off the bus on success.
    pub fn device_reset(&self, subcode: u8) -> Result<Reply, SessionError> {
        self.session.execute(Operation::DeviceReset { subcode })
    }

    /// Windowed LBA read of `count` sectors starting at `sector`.
    pub fn read_lba(&self, sector: u32, count: u32) -> BatchedRead<'_, T> {
        self.session.read_lba(sector, count, false)
    }

    /// Windowed raw sector read including out-of-band bytes.
    pub fn read_sector(&self, sector: u32, count: u32) -> BatchedRead<'_, T> {
        self.session.read_sector(sector, count)
    }

    /// Windowed RAM read of `size` bytes at `address`.
    pub fn read_sdram(&self, address: u32, size: u32) -> BatchedRead<'_, T> {
        self.session.read_sdram(address, size)
    }

    /// Write `payload` to `count` raw sectors (with OOB bytes) at `sector`.
    /// Hard-limited to 32 sectors per call.
    pub fn write_sector(&self, sector: u32, count: u16, payload: &[u8]) -> Result<Reply, SessionError> {
        self.session
            .execute_write(Operation::WriteSector { sector, count }, payload)
    }

    /// Hand control to code previously loaded at `address`.
    pub fn execute_sdram(&self, address: u32) -> Result<Reply, SessionError> {
        self.session.execute(Operation::ExecuteSdram { address })
    }

    /// Push a first-stage image into on-chip SRAM.
    pub fn load_sram(&self, image: &[u8]) -> Result<(), TransportError> {
        load_to_ram(
            self.session.transport(),
            RamTarget::Sram,
            image,
            self.encrypt,
            self.session.timeout(),
        )
    }

    /// Push a second-stage image into DRAM.
    pub fn load_dram(&self, image: &[u8]) -> Result<(), TransportError> {
        load_to_ram(
            self.session.transport(),
            RamTarget::Dram,
            image,
            self.encrypt,
            self.session.timeout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::CONTROL_INDEX_SRAM;
    use crate::protocol::frame::STATUS_OK;
    use crate::transport::MockTransport;

    fn device() -> MaskromDevice<MockTransport> {
        MaskromDevice::from_transport(MockTransport::new(), Duration::from_millis(50))
    }

    #[test]
    fn chip_info_through_the_facade() {
        let dev = device();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"C033"); // rk3399 family tag, reversed
        buf.extend_from_slice(b"9102"); // year 2019
        buf.extend_from_slice(b"0715");
        buf.extend_from_slice(b"1.1V");
        dev.session().transport().queue_read(&buf);
        dev.session().transport().queue_status(STATUS_OK);

        match dev.read_chip_info().unwrap() {
            Reply::ChipInfo(info) => assert_eq!(info.tag, "330C"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn sram_load_goes_through_control_path() {
        let dev = device();
        dev.load_sram(b"ddrbin").unwrap();
        let transfers = dev.session().transport().control_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, CONTROL_INDEX_SRAM);
        // obfuscated image plus checksum
        assert_eq!(transfers[0].1.len(), 6 + 2);
    }
}
