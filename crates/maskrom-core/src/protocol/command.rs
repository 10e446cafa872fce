//! Command catalog for the maskrom bulk protocol.
//!
//! Each logical operation maps to a fixed opcode, sub-code, command-block
//! length, transfer direction and data-stage length formula. The session
//! consults [`Operation::reply_kind`] to know what shape of payload to
//! decode when the exchange succeeds.

use super::constants::{BLOCK_SIZE, OOB_SIZE, USB_MAX_SECTOR_COUNT, USB_MAX_TRANSFER_SIZE};
use super::frame::{Direction, OperationDescriptor, RequestFrame};

/// Command opcodes understood by the maskrom agent.
///
/// Older ROM revisions implement only a subset; the session surfaces a
/// rejected opcode as an `Unsupported` reply rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    TestUnitReady = 0,
    ReadFlashId = 1,
    ReadSector = 4,
    WriteSector = 5,
    EraseNormal = 6,
    EraseForce = 11,
    ReadLba = 20,
    WriteLba = 21,
    EraseSystemDisk = 22,
    ReadSdram = 23,
    WriteSdram = 24,
    ExecuteSdram = 25,
    ReadFlashInfo = 26,
    ReadChipInfo = 27,
    SetResetFlag = 30,
    WriteEfuse = 31,
    ReadEfuse = 32,
    ReadSpiFlash = 33,
    WriteSpiFlash = 34,
    WriteNewEfuse = 35,
    ReadNewEfuse = 36,
    EraseLba = 37,
    ReadCapability = 170,
    DeviceReset = 255,
}

/// Payload shape the device answers a successful command with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// No data stage; the status frame is the whole answer.
    Status,
    FlashId,
    ChipInfo,
    FlashInfo,
    Capability,
    /// Raw data-stage bytes.
    Buffer,
}

/// A logical maskrom operation with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    TestUnitReady,
    ReadFlashId,
    ReadSector { sector: u32, count: u16 },
    WriteSector { sector: u32, count: u16 },
    EraseNormal { block: u32, count: u16 },
    EraseForce { block: u32, count: u16 },
    ReadLba { sector: u32, count: u16, alt_method: bool },
    WriteLba { sector: u32, count: u16, alt_method: bool },
    EraseSystemDisk,
    ReadSdram { address: u32, size: u32 },
    WriteSdram { address: u32, size: u32 },
    ExecuteSdram { address: u32 },
    ReadFlashInfo,
    ReadChipInfo,
    SetResetFlag,
    WriteEfuse { address: u32, length: u16 },
    ReadEfuse { address: u32, length: u16 },
    ReadSpiFlash { address: u32, length: u16 },
    WriteSpiFlash { address: u32, length: u16 },
    WriteNewEfuse { address: u32, length: u16 },
    ReadNewEfuse { address: u32, length: u16 },
    EraseLba { sector: u32, count: u16 },
    ReadCapability,
    DeviceReset { subcode: u8 },
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::TestUnitReady => Opcode::TestUnitReady,
            Operation::ReadFlashId => Opcode::ReadFlashId,
            Operation::ReadSector { .. } => Opcode::ReadSector,
            Operation::WriteSector { .. } => Opcode::WriteSector,
            Operation::EraseNormal { .. } => Opcode::EraseNormal,
            Operation::EraseForce { .. } => Opcode::EraseForce,
            Operation::ReadLba { .. } => Opcode::ReadLba,
            Operation::WriteLba { .. } => Opcode::WriteLba,
            Operation::EraseSystemDisk => Opcode::EraseSystemDisk,
            Operation::ReadSdram { .. } => Opcode::ReadSdram,
            Operation::WriteSdram { .. } => Opcode::WriteSdram,
            Operation::ExecuteSdram { .. } => Opcode::ExecuteSdram,
            Operation::ReadFlashInfo => Opcode::ReadFlashInfo,
            Operation::ReadChipInfo => Opcode::ReadChipInfo,
            Operation::SetResetFlag => Opcode::SetResetFlag,
            Operation::WriteEfuse { .. } => Opcode::WriteEfuse,
            Operation::ReadEfuse { .. } => Opcode::ReadEfuse,
            Operation::ReadSpiFlash { .. } => Opcode::ReadSpiFlash,
            Operation::WriteSpiFlash { .. } => Opcode::WriteSpiFlash,
            Operation::WriteNewEfuse { .. } => Opcode::WriteNewEfuse,
            Operation::ReadNewEfuse { .. } => Opcode::ReadNewEfuse,
            Operation::EraseLba { .. } => Opcode::EraseLba,
            Operation::ReadCapability => Opcode::ReadCapability,
            Operation::DeviceReset { .. } => Opcode::DeviceReset,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Operation::WriteSector { .. }
            | Operation::EraseNormal { .. }
            | Operation::EraseForce { .. }
            | Operation::WriteLba { .. }
            | Operation::EraseSystemDisk
            | Operation::WriteSdram { .. }
            | Operation::ExecuteSdram { .. }
            | Operation::SetResetFlag
            | Operation::WriteEfuse { .. }
            | Operation::WriteSpiFlash { .. }
            | Operation::WriteNewEfuse { .. }
            | Operation::EraseLba { .. } => Direction::Out,
            _ => Direction::In,
        }
    }

    /// Valid command-block length: 6 for the bare form, 10 when the
    /// descriptor carries an address.
    pub fn cblen(&self) -> u8 {
        match self {
            Operation::TestUnitReady
            | Operation::ReadFlashId
            | Operation::EraseSystemDisk
            | Operation::ReadFlashInfo
            | Operation::ReadChipInfo
            | Operation::SetResetFlag
            | Operation::ReadCapability
            | Operation::DeviceReset { .. } => 6,
            _ => 10,
        }
    }

    /// Expected data-stage length in bytes, 0 if the command carries none.
    pub fn data_len(&self) -> u32 {
        match *self {
            Operation::ReadFlashId => 5,
            Operation::ReadSector { count, .. } | Operation::WriteSector { count, .. } => {
                count as u32 * (BLOCK_SIZE + OOB_SIZE) as u32
            }
            Operation::ReadLba { count, .. } | Operation::WriteLba { count, .. } => {
                count as u32 * BLOCK_SIZE as u32
            }
            Operation::ReadSdram { size, .. } | Operation::WriteSdram { size, .. } => size,
            Operation::ReadFlashInfo => USB_MAX_TRANSFER_SIZE,
            Operation::ReadChipInfo => 16,
            Operation::WriteEfuse { length, .. }
            | Operation::ReadEfuse { length, .. }
            | Operation::ReadSpiFlash { length, .. }
            | Operation::WriteSpiFlash { length, .. }
            | Operation::WriteNewEfuse { length, .. }
            | Operation::ReadNewEfuse { length, .. } => length as u32,
            Operation::ReadCapability => 8,
            _ => 0,
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self.direction() {
            Direction::Out => ReplyKind::Status,
            Direction::In => match self {
                Operation::ReadFlashId => ReplyKind::FlashId,
                Operation::ReadFlashInfo => ReplyKind::FlashInfo,
                Operation::ReadChipInfo => ReplyKind::ChipInfo,
                Operation::ReadCapability => ReplyKind::Capability,
                Operation::TestUnitReady | Operation::DeviceReset { .. } => ReplyKind::Status,
                _ => ReplyKind::Buffer,
            },
        }
    }

    /// The hard per-request sector ceiling for the raw sector commands.
    /// Returns the offending (requested, limit) pair when exceeded; such a
    /// request must be rejected before any I/O.
    pub fn over_sector_limit(&self) -> Option<(u16, u16)> {
        match *self {
            Operation::ReadSector { count, .. } | Operation::WriteSector { count, .. }
                if count > USB_MAX_SECTOR_COUNT =>
            {
                Some((count, USB_MAX_SECTOR_COUNT))
            }
            _ => None,
        }
    }

    fn descriptor(&self) -> OperationDescriptor {
        let (subcode, address, length) = match *self {
            Operation::ReadSector { sector, count } | Operation::WriteSector { sector, count } => {
                (0, sector, count)
            }
            Operation::EraseNormal { block, count } | Operation::EraseForce { block, count } => {
                (0, block, count)
            }
            Operation::ReadLba {
                sector,
                count,
                alt_method,
            }
            | Operation::WriteLba {
                sector,
                count,
                alt_method,
            } => (alt_method as u8, sector, count),
            // the descriptor length wraps at 64K; the outer frame length
            // carries the true byte count
            Operation::ReadSdram { address, size } | Operation::WriteSdram { address, size } => {
                (0, address, size as u16)
            }
            Operation::ExecuteSdram { address } => (0, address, 0),
            Operation::WriteEfuse { address, length }
            | Operation::ReadEfuse { address, length }
            | Operation::ReadSpiFlash { address, length }
            | Operation::WriteSpiFlash { address, length }
            | Operation::WriteNewEfuse { address, length }
            | Operation::ReadNewEfuse { address, length } => (0, address, length),
            Operation::EraseLba { sector, count } => (0, sector, count),
            Operation::DeviceReset { subcode } => (subcode, 0, 0),
            _ => (0, 0, 0),
        };
        OperationDescriptor {
            code: self.opcode() as u8,
            subcode,
            address,
            length,
        }
    }

    /// Serialize into a request frame with a fresh tag.
    pub fn request(&self) -> RequestFrame {
        RequestFrame::new(
            self.descriptor(),
            self.direction(),
            self.cblen(),
            self.data_len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_numbers() {
        assert_eq!(Opcode::TestUnitReady as u8, 0);
        assert_eq!(Opcode::ReadFlashId as u8, 1);
        assert_eq!(Opcode::ReadSector as u8, 4);
        assert_eq!(Opcode::WriteSector as u8, 5);
        assert_eq!(Opcode::EraseNormal as u8, 6);
        assert_eq!(Opcode::EraseForce as u8, 11);
        assert_eq!(Opcode::ReadLba as u8, 20);
        assert_eq!(Opcode::WriteLba as u8, 21);
        assert_eq!(Opcode::EraseSystemDisk as u8, 22);
        assert_eq!(Opcode::ReadSdram as u8, 23);
        assert_eq!(Opcode::WriteSdram as u8, 24);
        assert_eq!(Opcode::ExecuteSdram as u8, 25);
        assert_eq!(Opcode::ReadFlashInfo as u8, 26);
        assert_eq!(Opcode::ReadChipInfo as u8, 27);
        assert_eq!(Opcode::SetResetFlag as u8, 30);
        assert_eq!(Opcode::WriteEfuse as u8, 31);
        assert_eq!(Opcode::ReadEfuse as u8, 32);
        assert_eq!(Opcode::ReadSpiFlash as u8, 33);
        assert_eq!(Opcode::WriteSpiFlash as u8, 34);
        assert_eq!(Opcode::WriteNewEfuse as u8, 35);
        assert_eq!(Opcode::ReadNewEfuse as u8, 36);
        assert_eq!(Opcode::EraseLba as u8, 37);
        assert_eq!(Opcode::ReadCapability as u8, 170);
        assert_eq!(Opcode::DeviceReset as u8, 255);
    }

    #[test]
    fn data_length_formulas() {
        assert_eq!(Operation::ReadFlashId.data_len(), 5);
        assert_eq!(Operation::ReadChipInfo.data_len(), 16);
        assert_eq!(Operation::ReadCapability.data_len(), 8);
        assert_eq!(
            Operation::ReadLba {
                sector: 0,
                count: 3,
                alt_method: false
            }
            .data_len(),
            3 * 512
        );
        assert_eq!(
            Operation::ReadSector {
                sector: 0,
                count: 2
            }
            .data_len(),
            2 * 528
        );
        assert_eq!(Operation::EraseSystemDisk.data_len(), 0);
    }

    #[test]
    fn block_lengths_and_directions() {
        assert_eq!(Operation::TestUnitReady.cblen(), 6);
        assert_eq!(Operation::ReadChipInfo.cblen(), 6);
        assert_eq!(
            Operation::ReadLba {
                sector: 0,
                count: 1,
                alt_method: false
            }
            .cblen(),
            10
        );
        assert_eq!(Operation::TestUnitReady.direction(), Direction::In);
        assert_eq!(Operation::DeviceReset { subcode: 0 }.direction(), Direction::In);
        assert_eq!(
            Operation::WriteLba {
                sector: 0,
                count: 1,
                alt_method: false
            }
            .direction(),
            Direction::Out
        );
        assert_eq!(Operation::ExecuteSdram { address: 0 }.direction(), Direction::Out);
    }

    #[test]
    fn lba_subcode_selects_alt_method() {
        let req = Operation::ReadLba {
            sector: 0x100,
            count: 8,
            alt_method: true,
        }
        .request();
        assert_eq!(req.op.subcode, 1);
        assert_eq!(req.op.address, 0x100);
        assert_eq!(req.op.length, 8);
        assert_eq!(req.length, 8 * 512);
    }

    #[test]
    fn sector_limit_guard() {
        assert!(
            Operation::ReadSector {
                sector: 0,
                count: 32
            }
            .over_sector_limit()
            .is_none()
        );
        assert_eq!(
            Operation::WriteSector {
                sector: 0,
                count: 33
            }
            .over_sector_limit(),
            Some((33, 32))
        );
    }

    #[test]
    fn sdram_descriptor_length_wraps() {
        let req = Operation::ReadSdram {
            address: 0x6000_0000,
            size: 65536,
        }
        .request();
        assert_eq!(req.length, 65536);
        assert_eq!(req.op.length, 0);
    }
}
