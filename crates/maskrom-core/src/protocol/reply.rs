//! Typed decodes for command replies.
//!
//! The session picks the decode shape from the command catalog entry and
//! hands the data-stage bytes here. Decodes degrade gracefully: fields the
//! device filled with garbage fall back to their raw bytes instead of
//! failing the whole reply.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::command::ReplyKind;
use super::constants::{flash_manufacturer, soc_name};
use super::frame::ProtocolError;

/// Per-device divisor applied to the geometry a dual-die flash reports.
const DEFAULT_CHIP_COUNT: u64 = 2;

/// Discriminated result of a completed exchange.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The status frame was the whole answer; `true` means the device
    /// reported OK, `false` a non-exceptional FAIL.
    Status(bool),
    FlashId(FlashId),
    ChipInfo(ChipInfo),
    FlashInfo(FlashInfo),
    Capability(Capability),
    /// Raw data-stage bytes.
    Buffer(Vec<u8>),
    /// The device rejected or does not implement the opcode. Expected on
    /// older ROM revisions; not a fatal condition.
    Unsupported,
}

impl Reply {
    /// Decode a successful exchange's data stage per the catalog shape.
    pub fn decode(kind: ReplyKind, data: Vec<u8>) -> Result<Self, ProtocolError> {
        Ok(match kind {
            ReplyKind::Status => Reply::Status(true),
            ReplyKind::FlashId => Reply::FlashId(FlashId::decode(&data)),
            ReplyKind::ChipInfo => Reply::ChipInfo(ChipInfo::decode(&data)?),
            ReplyKind::FlashInfo => Reply::FlashInfo(FlashInfo::decode(&data)?),
            ReplyKind::Capability => Reply::Capability(Capability::decode(&data)?),
            ReplyKind::Buffer => Reply::Buffer(data),
        })
    }

    /// Whether the exchange completed with an OK status.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Reply::Status(false) | Reply::Unsupported)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(true) => write!(f, "ok"),
            Reply::Status(false) => write!(f, "failed"),
            Reply::FlashId(v) => v.fmt(f),
            Reply::ChipInfo(v) => v.fmt(f),
            Reply::FlashInfo(v) => v.fmt(f),
            Reply::Capability(v) => v.fmt(f),
            Reply::Buffer(data) => write!(f, "{} bytes", data.len()),
            Reply::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Flash identity string, e.g. "EMMC " or a raw NAND id.
#[derive(Debug, Clone)]
pub struct FlashId {
    pub id: String,
}

impl FlashId {
    fn decode(data: &[u8]) -> Self {
        Self {
            id: String::from_utf8_lossy(data).into_owned(),
        }
    }
}

impl fmt::Display for FlashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={}", self.id)
    }
}

/// Manufacture date from the chip-info block, or its raw bytes when the
/// device reports something unparsable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipDate {
    Parsed { year: u16, month: u8, day: u8 },
    Raw([u8; 8]),
}

impl fmt::Display for ChipDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipDate::Parsed { year, month, day } => {
                write!(f, "{year:04}-{month:02}-{day:02}")
            }
            ChipDate::Raw(bytes) => write!(f, "{bytes:02x?}"),
        }
    }
}

/// Silicon revision, or its raw bytes when not printable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Text(String),
    Raw([u8; 4]),
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Text(s) => f.write_str(s),
            Revision::Raw(bytes) => write!(f, "{bytes:02x?}"),
        }
    }
}

/// Decoded chip-info block (16 bytes).
///
/// Every multi-byte field arrives byte-reversed from the device.
#[derive(Debug, Clone)]
pub struct ChipInfo {
    /// 4-character SoC tag, already un-reversed.
    pub tag: String,
    /// SoC name resolved from the tag table, if known.
    pub soc: Option<&'static str>,
    pub date: ChipDate,
    pub revision: Revision,
}

impl ChipInfo {
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 16 {
            return Err(ProtocolError::ShortFrame {
                expected: 16,
                actual: data.len(),
            });
        }
        let tag: String = data[..4].iter().rev().map(|&b| b as char).collect();

        let year: Vec<u8> = data[4..8].iter().rev().copied().collect();
        let date = match (
            parse_ascii_u16(&year),
            parse_ascii_u16(&data[8..10]),
            parse_ascii_u16(&data[10..12]),
        ) {
            (Some(year), Some(month), Some(day)) => ChipDate::Parsed {
                year,
                month: month as u8,
                day: day as u8,
            },
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[4..12]);
                ChipDate::Raw(raw)
            }
        };

        let rev: Vec<u8> = data[12..16].iter().rev().copied().collect();
        let revision = match String::from_utf8(rev.clone()) {
            Ok(s) => Revision::Text(s),
            Err(_) => Revision::Raw([rev[0], rev[1], rev[2], rev[3]]),
        };

        let soc = soc_name(&tag);
        Ok(Self {
            tag,
            soc,
            date,
            revision,
        })
    }
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag={} soc={} date={} revision={}",
            self.tag,
            self.soc.unwrap_or("unknown"),
            self.date,
            self.revision
        )
    }
}

/// Decoded flash geometry (11-byte little-endian block plus reserved tail).
///
/// Sizes are reported per package in KiB units and scaled down by the chip
/// count divisor.
#[derive(Debug, Clone)]
pub struct FlashInfo {
    /// Total flash size in bytes.
    pub flash_size: u64,
    /// Erase block size in bytes.
    pub block_size: u64,
    /// Page size in bytes.
    pub page_size: u64,
    pub block_count: u64,
    pub sectors_per_block: u64,
    pub ecc_bits: u8,
    pub access_time: u8,
    pub manufacturer_id: u8,
    pub manufacturer: Option<&'static str>,
    pub chip_select: u8,
}

impl FlashInfo {
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 11 {
            return Err(ProtocolError::ShortFrame {
                expected: 11,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let flash_size_kb = cursor.read_u32::<LittleEndian>().unwrap() as u64;
        let block_size_kb = cursor.read_u16::<LittleEndian>().unwrap() as u64;
        let page_size_kb = cursor.read_u8().unwrap() as u64;
        let ecc_bits = cursor.read_u8().unwrap();
        let access_time = cursor.read_u8().unwrap();
        let manufacturer_id = cursor.read_u8().unwrap();
        let chip_select = cursor.read_u8().unwrap();

        let flash_size = flash_size_kb * 1024 / DEFAULT_CHIP_COUNT;
        let block_size = block_size_kb * 1024 / DEFAULT_CHIP_COUNT;
        let page_size = page_size_kb * 1024 / DEFAULT_CHIP_COUNT;
        Ok(Self {
            flash_size,
            block_size,
            page_size,
            block_count: if block_size > 0 { flash_size / block_size } else { 0 },
            sectors_per_block: if page_size > 0 { block_size / page_size } else { 0 },
            ecc_bits,
            access_time,
            manufacturer_id,
            manufacturer: flash_manufacturer(manufacturer_id),
            chip_select,
        })
    }
}

impl fmt::Display for FlashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} blocks={}x{} pages={} ecc={}b manufacturer={} cs={}",
            pretty_size(self.flash_size),
            self.block_count,
            pretty_size(self.block_size),
            pretty_size(self.page_size),
            self.ecc_bits,
            self.manufacturer.unwrap_or("unknown"),
            self.chip_select
        )
    }
}

/// Feature flags reported by read_capability (8-byte bitset).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capability {
    pub direct_lba: bool,
    pub vendor_storage: bool,
    pub first_4m_access: bool,
    pub read_lba: bool,
    pub new_vendor_storage: bool,
    pub read_com_log: bool,
    pub read_idb_config: bool,
    pub read_secure_mode: bool,
    pub new_idb: bool,
    pub switch_storage: bool,
    pub lba_parity: bool,
    pub read_otp_chip: bool,
    pub switch_usb3: bool,
}

impl Capability {
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 8 {
            return Err(ProtocolError::ShortFrame {
                expected: 8,
                actual: data.len(),
            });
        }
        Ok(Self {
            direct_lba: data[0] & (1 << 0) != 0,
            vendor_storage: data[0] & (1 << 1) != 0,
            first_4m_access: data[0] & (1 << 2) != 0,
            read_lba: data[0] & (1 << 3) != 0,
            new_vendor_storage: data[0] & (1 << 4) != 0,
            read_com_log: data[0] & (1 << 5) != 0,
            read_idb_config: data[0] & (1 << 6) != 0,
            read_secure_mode: data[0] & (1 << 7) != 0,
            new_idb: data[1] & (1 << 0) != 0,
            switch_storage: data[1] & (1 << 1) != 0,
            lba_parity: data[1] & (1 << 2) != 0,
            read_otp_chip: data[1] & (1 << 3) != 0,
            switch_usb3: data[1] & (1 << 4) != 0,
        })
    }

    fn flags(&self) -> impl Iterator<Item = &'static str> {
        [
            (self.direct_lba, "direct_lba"),
            (self.vendor_storage, "vendor_storage"),
            (self.first_4m_access, "first_4m_access"),
            (self.read_lba, "read_lba"),
            (self.new_vendor_storage, "new_vendor_storage"),
            (self.read_com_log, "read_com_log"),
            (self.read_idb_config, "read_idb_config"),
            (self.read_secure_mode, "read_secure_mode"),
            (self.new_idb, "new_idb"),
            (self.switch_storage, "switch_storage"),
            (self.lba_parity, "lba_parity"),
            (self.read_otp_chip, "read_otp_chip"),
            (self.switch_usb3, "switch_usb3"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.flags() {
            if !first {
                write!(f, " ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

fn parse_ascii_u16(bytes: &[u8]) -> Option<u16> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Human-readable size with binary prefixes, e.g. `4KB`, `7.25GB`.
pub fn pretty_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["", "K", "M", "G", "T", "P", "E"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value.fract() < 1e-9 {
        format!("{}{}B", value as u64, UNITS[unit])
    } else {
        format!("{:.2}{}B", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_info_decodes_reversed_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"B013"); // tag, reversed on the wire
        buf.extend_from_slice(b"3202"); // year
        buf.extend_from_slice(b"11"); // month
        buf.extend_from_slice(b"52"); // day... stored as-is
        buf.extend_from_slice(b"0.2V"); // revision, reversed
        let info = ChipInfo::decode(&buf).unwrap();
        assert_eq!(info.tag, "310B");
        assert_eq!(info.soc, Some("rk31"));
        assert_eq!(
            info.date,
            ChipDate::Parsed {
                year: 2023,
                month: 11,
                day: 52
            }
        );
        assert_eq!(info.revision, Revision::Text("V2.0".into()));
    }

    #[test]
    fn chip_info_degrades_bad_date() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"72KR");
        buf.extend_from_slice(&[0xFF; 8]);
        buf.extend_from_slice(b"0.1V");
        let info = ChipInfo::decode(&buf).unwrap();
        assert_eq!(info.tag, "RK27");
        assert_eq!(info.soc, Some("rk27"));
        assert_eq!(info.date, ChipDate::Raw([0xFF; 8]));
    }

    #[test]
    fn chip_info_rejects_short_buffer() {
        assert!(matches!(
            ChipInfo::decode(&[0; 8]),
            Err(ProtocolError::ShortFrame { .. })
        ));
    }

    #[test]
    fn flash_info_scales_by_chip_count() {
        // 8 GiB reported as KiB, 512 KiB blocks, 8 KiB pages, samsung
        let mut buf = Vec::new();
        buf.extend_from_slice(&8_388_608u32.to_le_bytes());
        buf.extend_from_slice(&512u16.to_le_bytes());
        buf.push(8);
        buf.push(40); // ecc
        buf.push(25); // access time
        buf.push(0); // manufacturer
        buf.push(1); // chip select
        let info = FlashInfo::decode(&buf).unwrap();
        assert_eq!(info.flash_size, 8_388_608 * 1024 / 2);
        assert_eq!(info.block_size, 512 * 1024 / 2);
        assert_eq!(info.page_size, 8 * 1024 / 2);
        assert_eq!(info.block_count, info.flash_size / info.block_size);
        assert_eq!(info.sectors_per_block, 64);
        assert_eq!(info.manufacturer, Some("samsung"));
    }

    #[test]
    fn capability_bits() {
        let cap = Capability::decode(&[0b0000_1001, 0b0000_0001, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(cap.direct_lba);
        assert!(cap.read_lba);
        assert!(cap.new_idb);
        assert!(!cap.vendor_storage);
        assert!(!cap.switch_usb3);
    }

    #[test]
    fn pretty_sizes() {
        assert_eq!(pretty_size(0), "0B");
        assert_eq!(pretty_size(512), "512B");
        assert_eq!(pretty_size(4096), "4KB");
        assert_eq!(pretty_size(3 * 1024 * 1024), "3MB");
        assert_eq!(pretty_size(1536), "1.50KB");
    }
}
